use anyhow::{Context, Result, anyhow};

use super::{
    device_io::DeviceIO,
    protocol::{Command, Response, STATUS_OK},
};

/// HID communication timeout in milliseconds.
pub const READ_TIMEOUT: i32 = 250;

/// One Riing Quad controller and its HID link.
///
/// Every command is a write followed by a status read, so callers must
/// serialize access; fan writers share a controller behind a mutex.
#[derive(Debug)]
pub struct Controller<Io: DeviceIO> {
    pub name: String,
    pub dev: Io,
}

impl<Io: DeviceIO> Controller<Io> {
    pub fn new(name: impl Into<String>, dev: Io) -> Self {
        Self {
            name: name.into(),
            dev,
        }
    }

    fn request(&self, cmd: Command) -> Result<Response> {
        self.dev.write(&cmd.to_bytes())?;
        let mut buf = vec![0u8; cmd.expected_response_len()];
        self.dev.read(&mut buf, READ_TIMEOUT)?;
        Response::parse(&cmd, &buf)
    }

    fn expect_ok(&self, cmd: Command, what: &str) -> Result<()> {
        match self.request(cmd) {
            Ok(Response::Status(STATUS_OK)) => Ok(()),
            Ok(Response::Status(status)) => Err(anyhow!(
                "Invalid {what} response from {}: status {status:#04X}",
                self.name
            )),
            Ok(other) => Err(anyhow!("Unexpected {what} response: {other:?}")),
            Err(e) => Err(e).with_context(|| format!("{what} failed on {}", self.name)),
        }
    }

    /// Init handshake; must succeed before any other command.
    pub fn init(&self) -> Result<()> {
        self.expect_ok(Command::Init, "init")
    }

    /// Returns `(major, minor, patch)`.
    pub fn firmware_version(&self) -> Result<(u8, u8, u8)> {
        match self.request(Command::GetFirmwareVersion)? {
            Response::FirmwareVersion {
                major,
                minor,
                patch,
            } => Ok((major, minor, patch)),
            other => Err(anyhow!("Invalid firmware version response: {other:?}")),
        }
    }

    /// Sends one `(g, r, b)` triple per LED to `port` (1-based).
    pub fn set_rgb(&self, port: u8, mode: u8, colors: Vec<(u8, u8, u8)>) -> Result<()> {
        self.expect_ok(Command::SetRgb { port, mode, colors }, "set rgb")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::riing_quad::device_io::MockDeviceIO;

    fn responding(status: u8) -> MockDeviceIO {
        let mut dev = MockDeviceIO::new();
        dev.expect_write().returning(|buf| Ok(buf.len()));
        dev.expect_read().returning(move |buf, _| {
            buf[2] = status;
            Ok(())
        });
        dev
    }

    #[test]
    fn init_accepts_ok_status() {
        let controller = Controller::new("test", responding(STATUS_OK));
        assert!(controller.init().is_ok());
    }

    #[test]
    fn init_rejects_other_status() {
        let controller = Controller::new("test", responding(0x00));
        let error = controller.init().unwrap_err();
        assert!(error.to_string().contains("status 0x00"));
    }

    #[test]
    fn read_failure_propagates() {
        let mut dev = MockDeviceIO::new();
        dev.expect_write().returning(|buf| Ok(buf.len()));
        dev.expect_read()
            .returning(|_, _| Err(anyhow!("Incomplete read")));

        let controller = Controller::new("test", dev);
        let error = controller.set_rgb(1, 0x24, vec![]).unwrap_err();
        assert!(format!("{error:#}").contains("Incomplete read"));
    }
}
