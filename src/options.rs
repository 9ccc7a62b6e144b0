// Option negotiation (RFC 2347/2348/7440).
//
// The request carries free-form (name, value) string pairs. Policy here is
// strict where the RFCs are informal: unknown option names are dropped,
// numeric values outside the supported range are clamped to the nearest
// bound, and a value that does not parse as an integer refuses the whole
// negotiation. Negotiation runs exactly once per session and the result is
// immutable afterwards.

use crate::tftp::{
    Options, Packet, BLKSIZE_OPT, DEF_BLOCK_SIZE, DEF_WINDOW_SIZE, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE,
    WINDOWSIZE_OPT,
};
use std::error;
use std::fmt;

/// The (block size, window size) pair a session runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOptions {
    pub block_size: u16,
    pub window_size: u16,
}

impl Default for TransferOptions {
    fn default() -> Self {
        TransferOptions {
            block_size: DEF_BLOCK_SIZE,
            window_size: DEF_WINDOW_SIZE,
        }
    }
}

/// Locally configured ceilings for what a peer may negotiate. Requests above
/// a ceiling are clamped, never rejected.
#[derive(Debug, Clone, Copy)]
pub struct OptionLimits {
    pub max_block_size: u16,
    pub max_window_size: u16,
}

impl Default for OptionLimits {
    fn default() -> Self {
        OptionLimits {
            // A full-size block does not fit a standard ethernet frame, so
            // default to one that does and let operators raise it.
            max_block_size: 1428,
            max_window_size: 16,
        }
    }
}

/// A peer requested an option with a value we cannot interpret. Fatal to the
/// session before it starts; mapped to error code 8 on the wire.
#[derive(Debug, PartialEq)]
pub struct NegotiationError(pub String);

impl error::Error for NegotiationError {}

impl fmt::Display for NegotiationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "option negotiation failed: {}", self.0)
    }
}

fn parse_value(name: &str, value: &str) -> Result<u64, NegotiationError> {
    value
        .parse::<u64>()
        .map_err(|_| NegotiationError(format!("option '{name}' has non-numeric value '{value}'")))
}

fn clamp(value: u64, lo: u16, hi: u16) -> u16 {
    value.clamp(lo as u64, hi as u64) as u16
}

/// Resolves a request's option list against our limits. Returns the agreed
/// options plus the Oack to send when the peer asked for anything we
/// recognize; `None` means the legacy Data/Ack flow starts at defaults.
pub fn negotiate(
    requested: &Options,
    limits: &OptionLimits,
) -> Result<(TransferOptions, Option<Packet>), NegotiationError> {
    let mut agreed = TransferOptions::default();
    let mut reply = Options::new();

    for (name, value) in requested {
        match name.to_lowercase().as_str() {
            BLKSIZE_OPT => {
                let max = limits.max_block_size.min(MAX_BLOCK_SIZE);
                agreed.block_size = clamp(parse_value(name, value)?, MIN_BLOCK_SIZE, max);
                reply.insert(BLKSIZE_OPT.to_string(), agreed.block_size.to_string());
            }
            WINDOWSIZE_OPT => {
                agreed.window_size = clamp(parse_value(name, value)?, 1, limits.max_window_size);
                reply.insert(WINDOWSIZE_OPT.to_string(), agreed.window_size.to_string());
            }
            other => {
                log::debug!("ignoring unknown option {other}={value}");
            }
        }
    }

    if reply.is_empty() {
        Ok((agreed, None))
    } else {
        Ok((agreed, Some(Packet::Oack { options: reply })))
    }
}

/// Client-side counterpart: validates the server's Oack against what we
/// asked for. A server may shrink a value but never grow it past the request
/// or answer with an option we did not send.
pub fn accept_oack(
    requested: &TransferOptions,
    oack: &Options,
) -> Result<TransferOptions, NegotiationError> {
    let mut agreed = TransferOptions::default();

    for (name, value) in oack {
        match name.to_lowercase().as_str() {
            BLKSIZE_OPT => {
                let granted = parse_value(name, value)?;
                if granted < MIN_BLOCK_SIZE as u64 || granted > requested.block_size as u64 {
                    return Err(NegotiationError(format!(
                        "server granted blksize {granted}, requested {}",
                        requested.block_size
                    )));
                }
                agreed.block_size = granted as u16;
            }
            WINDOWSIZE_OPT => {
                let granted = parse_value(name, value)?;
                if granted < 1 || granted > requested.window_size as u64 {
                    return Err(NegotiationError(format!(
                        "server granted windowsize {granted}, requested {}",
                        requested.window_size
                    )));
                }
                agreed.window_size = granted as u16;
            }
            other => {
                return Err(NegotiationError(format!(
                    "server acknowledged option '{other}' we never requested"
                )));
            }
        }
    }

    Ok(agreed)
}

/// Builds the option list for an outgoing request. Defaults are left out so
/// a plain transfer stays a plain RFC 1350 exchange.
pub fn request_options(wanted: &TransferOptions) -> Options {
    let mut options = Options::new();
    if wanted.block_size != DEF_BLOCK_SIZE {
        options.insert(BLKSIZE_OPT.to_string(), wanted.block_size.to_string());
    }
    if wanted.window_size != DEF_WINDOW_SIZE {
        options.insert(WINDOWSIZE_OPT.to_string(), wanted.window_size.to_string());
    }
    options
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(pairs: &[(&str, &str)]) -> Options {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_no_options_means_legacy_flow() {
        let (agreed, oack) = negotiate(&Options::new(), &OptionLimits::default()).unwrap();
        assert_eq!(agreed, TransferOptions::default());
        assert!(oack.is_none());
    }

    #[test]
    fn test_unknown_options_ignored() {
        let requested = opts(&[("tsize", "0"), ("timeout", "5")]);
        let (agreed, oack) = negotiate(&requested, &OptionLimits::default()).unwrap();
        assert_eq!(agreed, TransferOptions::default());
        assert!(oack.is_none());
    }

    #[test]
    fn test_in_range_values_accepted_verbatim() {
        let requested = opts(&[("blksize", "1024"), ("windowsize", "8")]);
        let (agreed, oack) = negotiate(&requested, &OptionLimits::default()).unwrap();
        assert_eq!(agreed.block_size, 1024);
        assert_eq!(agreed.window_size, 8);
        assert_eq!(
            oack,
            Some(Packet::Oack {
                options: opts(&[("blksize", "1024"), ("windowsize", "8")]),
            })
        );
    }

    #[test]
    fn test_out_of_range_clamps_to_configured_max() {
        // 99999 does not even fit u16; it must clamp, not fail.
        let requested = opts(&[("blksize", "99999")]);
        let limits = OptionLimits {
            max_block_size: 1428,
            max_window_size: 16,
        };
        let (agreed, oack) = negotiate(&requested, &limits).unwrap();
        assert_eq!(agreed.block_size, 1428);
        assert_eq!(
            oack,
            Some(Packet::Oack {
                options: opts(&[("blksize", "1428")]),
            })
        );

        let requested = opts(&[("blksize", "2"), ("windowsize", "0")]);
        let (agreed, _) = negotiate(&requested, &limits).unwrap();
        assert_eq!(agreed.block_size, 8);
        assert_eq!(agreed.window_size, 1);
    }

    #[test]
    fn test_non_numeric_value_fails_negotiation() {
        let requested = opts(&[("blksize", "abc")]);
        assert!(negotiate(&requested, &OptionLimits::default()).is_err());
    }

    #[test]
    fn test_option_names_case_insensitive() {
        let requested = opts(&[("BlkSize", "1024")]);
        let (agreed, _) = negotiate(&requested, &OptionLimits::default()).unwrap();
        assert_eq!(agreed.block_size, 1024);
    }

    #[test]
    fn test_accept_oack_within_request() {
        let wanted = TransferOptions {
            block_size: 2048,
            window_size: 8,
        };
        let agreed = accept_oack(&wanted, &opts(&[("blksize", "1428"), ("windowsize", "4")]));
        assert_eq!(
            agreed.unwrap(),
            TransferOptions {
                block_size: 1428,
                window_size: 4,
            }
        );
    }

    #[test]
    fn test_accept_oack_rejects_inflated_grant() {
        let wanted = TransferOptions {
            block_size: 1024,
            window_size: 1,
        };
        assert!(accept_oack(&wanted, &opts(&[("blksize", "2048")])).is_err());
        assert!(accept_oack(&wanted, &opts(&[("blksize", "abc")])).is_err());
        assert!(accept_oack(&wanted, &opts(&[("tsize", "10")])).is_err());
    }

    #[test]
    fn test_request_options_omits_defaults() {
        assert!(request_options(&TransferOptions::default()).is_empty());
        let wanted = TransferOptions {
            block_size: 1024,
            window_size: 1,
        };
        assert_eq!(request_options(&wanted), opts(&[("blksize", "1024")]));
    }
}
