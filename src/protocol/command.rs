//! Outbound command encoding.
//!
//! Three command sets exist: the generic set every module answers, the
//! MicroFlu set, and the SAM set. Each command is a fixed byte template
//! parameterized by the one-byte channel address and, for a few commands, a
//! one-byte parameter. Multi-step commands concatenate their sub-frames into
//! a single write so the sensor sees them back to back.

use super::escape::escape;
use super::BLOCK_MARKER;
use crate::{AcquisitionError, Result};

pub(crate) const OP_QUERY: u8 = 0xB0;
const OP_QUERY_SAM: u8 = 0xB1;
const OP_ROM_PAGE0: u8 = 0xC0;
const OP_ROM_PAGE1: u8 = 0xC1;
const OP_SAMPLE: u8 = 0xA0;
const OP_INT_MODE: u8 = 0xA1;
const OP_AUTO_RANGE: u8 = 0xA2;
pub(crate) const OP_TRIGGER: u8 = 0xA3;
const OP_INT_TIME: u8 = 0xA5;
const OP_LOW_GAIN: u8 = 0xA6;
const OP_CONT_MODE: u8 = 0xA7;
const OP_CONTINUOUS: u8 = 0xA8;
const OP_FAST_AUTO: u8 = 0xA9;
const OP_AVERAGING: u8 = 0xAA;
const OP_SLEEP: u8 = 0xAD;
const OP_BAUD: u8 = 0xAF;

/// Commands in the generic set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenericCommand {
    Query,
}

/// Commands understood by MicroFlu modules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MicroFluCommand {
    Query,
    /// Read both ROM configuration pages (two sub-frames).
    ReadCfg,
    ContOn,
    ContOff,
    Start,
    Stop,
    AutoAmpOn,
    AutoAmpOff,
    LowAmpOn,
    LowAmpOff,
    /// Set the averaging depth.
    IntAvg(u8),
}

/// Commands understood by SAM/SAMIP modules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamCommand {
    Query,
    /// Select automatic integration and trigger one measurement.
    StartIntAuto,
    /// Select manual integration with the given time code and trigger one
    /// measurement (three sub-frames).
    StartIntSet(u8),
    ContModeOn,
    ContModeOff,
    SetIntTime(u8),
    Sleep,
    SetBaud(u8),
    FastAuto,
}

/// A command from any of the three sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Generic(GenericCommand),
    MicroFlu(MicroFluCommand),
    Sam(SamCommand),
}

/// One escaped sub-frame: marker plus escaped template body.
fn frame(address: u8, op: u8, arg: u8) -> Vec<u8> {
    let body = [0x00, address, 0x00, op, arg, 0x00, 0x01];
    let mut out = vec![BLOCK_MARKER];
    out.extend(escape(&body));
    out
}

impl Command {
    /// Encode the command for the given channel address. Multi-step commands
    /// return their sub-frames concatenated.
    pub fn encode(&self, address: u8) -> Vec<u8> {
        let steps: Vec<(u8, u8)> = match self {
            Command::Generic(GenericCommand::Query) => vec![(OP_QUERY, 0)],
            Command::MicroFlu(cmd) => match cmd {
                MicroFluCommand::Query => vec![(OP_QUERY, 0)],
                MicroFluCommand::ReadCfg => vec![(OP_ROM_PAGE0, 0), (OP_ROM_PAGE1, 0)],
                MicroFluCommand::ContOn => vec![(OP_CONTINUOUS, 1)],
                MicroFluCommand::ContOff => vec![(OP_CONTINUOUS, 0)],
                MicroFluCommand::Start => vec![(OP_SAMPLE, 1)],
                MicroFluCommand::Stop => vec![(OP_SAMPLE, 0)],
                MicroFluCommand::AutoAmpOn => vec![(OP_AUTO_RANGE, 1)],
                MicroFluCommand::AutoAmpOff => vec![(OP_AUTO_RANGE, 0)],
                MicroFluCommand::LowAmpOn => vec![(OP_LOW_GAIN, 1)],
                MicroFluCommand::LowAmpOff => vec![(OP_LOW_GAIN, 0)],
                MicroFluCommand::IntAvg(depth) => vec![(OP_AVERAGING, *depth)],
            },
            Command::Sam(cmd) => match cmd {
                SamCommand::Query => vec![(OP_QUERY_SAM, 0)],
                SamCommand::StartIntAuto => vec![(OP_INT_MODE, 0), (OP_TRIGGER, 1)],
                SamCommand::StartIntSet(code) => {
                    vec![(OP_INT_MODE, 1), (OP_INT_TIME, *code), (OP_TRIGGER, 1)]
                }
                SamCommand::ContModeOn => vec![(OP_CONT_MODE, 1)],
                SamCommand::ContModeOff => vec![(OP_CONT_MODE, 0)],
                SamCommand::SetIntTime(code) => vec![(OP_INT_TIME, *code)],
                SamCommand::Sleep => vec![(OP_SLEEP, 0)],
                SamCommand::SetBaud(code) => vec![(OP_BAUD, *code)],
                SamCommand::FastAuto => vec![(OP_FAST_AUTO, 1)],
            },
        };
        steps.into_iter().flat_map(|(op, arg)| frame(address, op, arg)).collect()
    }

    /// Stable name for logging and bookkeeping.
    pub fn label(&self) -> &'static str {
        match self {
            Command::Generic(GenericCommand::Query) => "query",
            Command::MicroFlu(cmd) => match cmd {
                MicroFluCommand::Query => "query",
                MicroFluCommand::ReadCfg => "ReadCfg",
                MicroFluCommand::ContOn => "cont_on",
                MicroFluCommand::ContOff => "cont_off",
                MicroFluCommand::Start => "start",
                MicroFluCommand::Stop => "stop",
                MicroFluCommand::AutoAmpOn => "autoamp_on",
                MicroFluCommand::AutoAmpOff => "autoamp_off",
                MicroFluCommand::LowAmpOn => "lowamp_on",
                MicroFluCommand::LowAmpOff => "lowamp_off",
                MicroFluCommand::IntAvg(_) => "int_avg",
            },
            Command::Sam(cmd) => match cmd {
                SamCommand::Query => "query_sam",
                SamCommand::StartIntAuto => "startIntAuto",
                SamCommand::StartIntSet(_) => "startIntSet",
                SamCommand::ContModeOn => "cont_mode_on",
                SamCommand::ContModeOff => "cont_mode_off",
                SamCommand::SetIntTime(_) => "setIntTime",
                SamCommand::Sleep => "sleep",
                SamCommand::SetBaud(_) => "setbaud",
                SamCommand::FastAuto => "fastauto",
            },
        }
    }

    /// Whether this command starts a measurement the fleet should wait for.
    pub fn is_measurement_trigger(&self) -> bool {
        matches!(
            self,
            Command::Sam(SamCommand::StartIntAuto)
                | Command::Sam(SamCommand::StartIntSet(_))
                | Command::MicroFlu(MicroFluCommand::Start)
        )
    }

    /// Resolve a command from its set and name, e.g. from an operator
    /// console. Unknown sets, unknown names, and missing or superfluous
    /// parameters are hard errors, never silent no-ops.
    pub fn from_name(set: &str, name: &str, param: Option<u8>) -> Result<Self> {
        fn no_param(cmd: Command, name: &str, param: Option<u8>) -> Result<Command> {
            match param {
                None => Ok(cmd),
                Some(_) => {
                    Err(AcquisitionError::command(format!("{name} takes no parameter")))
                }
            }
        }
        fn with_param(name: &str, param: Option<u8>) -> Result<u8> {
            param.ok_or_else(|| {
                AcquisitionError::command(format!("{name} requires a parameter"))
            })
        }

        match set {
            "None" => match name {
                "query" => no_param(Command::Generic(GenericCommand::Query), name, param),
                _ => Err(AcquisitionError::command(format!(
                    "unknown command {name:?} in set None"
                ))),
            },
            "MicroFlu" => {
                use MicroFluCommand::*;
                let cmd = match name {
                    "query" => Query,
                    "ReadCfg" => ReadCfg,
                    "cont_on" => ContOn,
                    "cont_off" => ContOff,
                    "start" => Start,
                    "stop" => Stop,
                    "autoamp_on" => AutoAmpOn,
                    "autoamp_off" => AutoAmpOff,
                    "lowamp_on" => LowAmpOn,
                    "lowamp_off" => LowAmpOff,
                    "int_avg" => IntAvg(with_param(name, param)?),
                    _ => {
                        return Err(AcquisitionError::command(format!(
                            "unknown command {name:?} in set MicroFlu"
                        )));
                    }
                };
                match cmd {
                    IntAvg(_) => Ok(Command::MicroFlu(cmd)),
                    _ => no_param(Command::MicroFlu(cmd), name, param),
                }
            }
            "SAM" => {
                use SamCommand::*;
                let cmd = match name {
                    "query_sam" => Query,
                    "startIntAuto" => StartIntAuto,
                    "startIntSet" => StartIntSet(with_param(name, param)?),
                    "cont_mode_on" => ContModeOn,
                    "cont_mode_off" => ContModeOff,
                    "setIntTime" => SetIntTime(with_param(name, param)?),
                    "sleep" => Sleep,
                    "setbaud" => SetBaud(with_param(name, param)?),
                    "fastauto" => FastAuto,
                    _ => {
                        return Err(AcquisitionError::command(format!(
                            "unknown command {name:?} in set SAM"
                        )));
                    }
                };
                match cmd {
                    StartIntSet(_) | SetIntTime(_) | SetBaud(_) => Ok(Command::Sam(cmd)),
                    _ => no_param(Command::Sam(cmd), name, param),
                }
            }
            _ => Err(AcquisitionError::command(format!("unknown command set {set:?}"))),
        }
    }
}

/// Integration-time code for a millisecond value: `ms = 2 * 2^code`.
/// Returns `None` for times the sensor cannot express.
pub fn integration_code(ms: u32) -> Option<u8> {
    (0u8..=15).find(|c| 2u32.checked_mul(1 << c) == Some(ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Sub-frame count of an encoded command (markers never appear escaped
    /// in command bodies, so counting marker bytes counts frames).
    fn frame_count(encoded: &[u8]) -> usize {
        encoded.iter().filter(|&&b| b == BLOCK_MARKER).count()
    }

    #[test]
    fn query_encodes_with_address() {
        let bytes = Command::Generic(GenericCommand::Query).encode(0x52);
        assert_eq!(frame_count(&bytes), 1);
        assert_eq!(bytes[0], BLOCK_MARKER);
        assert!(bytes.contains(&0x52));
        assert!(bytes.contains(&OP_QUERY));
    }

    #[test]
    fn multi_step_commands_concatenate_sub_frames() {
        assert_eq!(frame_count(&Command::MicroFlu(MicroFluCommand::ReadCfg).encode(2)), 2);
        assert_eq!(frame_count(&Command::Sam(SamCommand::StartIntAuto).encode(2)), 2);
        assert_eq!(frame_count(&Command::Sam(SamCommand::StartIntSet(7)).encode(2)), 3);
    }

    #[test]
    fn parameterized_commands_embed_their_parameter() {
        let bytes = Command::Sam(SamCommand::SetIntTime(0x0B)).encode(0x04);
        assert!(bytes.windows(2).any(|w| w == [OP_INT_TIME, 0x0B]));

        let bytes = Command::MicroFlu(MicroFluCommand::IntAvg(9)).encode(0x04);
        assert!(bytes.windows(2).any(|w| w == [OP_AVERAGING, 9]));
    }

    #[test]
    fn reserved_address_bytes_are_escaped() {
        // Address 0x23 collides with the block marker; the body must carry
        // it escaped so only the leading marker of each sub-frame survives.
        let bytes = Command::Generic(GenericCommand::Query).encode(BLOCK_MARKER);
        assert_eq!(frame_count(&bytes), 1);
    }

    #[test]
    fn from_name_resolves_known_commands() {
        let cmd = Command::from_name("SAM", "startIntSet", Some(7)).expect("resolves");
        assert_eq!(cmd, Command::Sam(SamCommand::StartIntSet(7)));
        assert!(cmd.is_measurement_trigger());

        let cmd = Command::from_name("MicroFlu", "cont_off", None).expect("resolves");
        assert_eq!(cmd, Command::MicroFlu(MicroFluCommand::ContOff));
        assert!(!cmd.is_measurement_trigger());
    }

    #[test]
    fn from_name_rejects_unknown_and_malformed() {
        assert!(Command::from_name("Borg", "query", None).is_err());
        assert!(Command::from_name("SAM", "warp", None).is_err());
        assert!(Command::from_name("SAM", "setIntTime", None).is_err());
        assert!(Command::from_name("SAM", "sleep", Some(1)).is_err());
        assert!(Command::from_name("MicroFlu", "int_avg", None).is_err());
    }

    #[test]
    fn integration_codes_are_exact_powers() {
        assert_eq!(integration_code(2), Some(0));
        assert_eq!(integration_code(256), Some(7));
        assert_eq!(integration_code(8192), Some(12));
        assert_eq!(integration_code(100), None);
        assert_eq!(integration_code(0), None);
    }
}
