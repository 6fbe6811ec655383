use anyhow::{Result, anyhow};

/// Length of every controller response.
pub const RESPONSE_LEN: usize = 193;

/// Status byte reported for an accepted command.
pub const STATUS_OK: u8 = 0xFC;

/// `SetRgb` mode taking one color per LED.
pub const MODE_PER_LED: u8 = 0x24;

#[derive(Clone, Debug)]
pub enum Command {
    Init,
    GetFirmwareVersion,
    /// Colors are `(g, r, b)` triples, one per LED.
    SetRgb {
        port: u8,
        mode: u8,
        colors: Vec<(u8, u8, u8)>,
    },
}

impl Command {
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Command::Init => vec![0x00, 0xFE, 0x33],
            Command::GetFirmwareVersion => vec![0x00, 0x33, 0x50],
            Command::SetRgb { port, mode, colors } => {
                let mut buf = Vec::with_capacity(5 + 3 * colors.len());
                buf.extend_from_slice(&[0x00, 0x32, 0x52, *port, *mode]);
                for &(g, r, b) in colors {
                    buf.extend_from_slice(&[g, r, b]);
                }
                buf
            }
        }
    }

    pub fn expected_response_len(&self) -> usize {
        RESPONSE_LEN
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Response {
    Status(u8),
    FirmwareVersion { major: u8, minor: u8, patch: u8 },
}

impl Response {
    pub fn parse(cmd: &Command, buf: &[u8]) -> Result<Self> {
        match cmd {
            Command::Init | Command::SetRgb { .. } => buf
                .get(2)
                .copied()
                .map(Response::Status)
                .ok_or_else(|| anyhow!("Empty status response")),
            Command::GetFirmwareVersion => match buf.get(2..5) {
                Some(&[major, minor, patch]) => Ok(Response::FirmwareVersion {
                    major,
                    minor,
                    patch,
                }),
                _ => Err(anyhow!("Buffer too small for firmware version")),
            },
        }
    }
}
