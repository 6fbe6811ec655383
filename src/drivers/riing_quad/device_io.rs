use anyhow::{Result, anyhow, bail};
use hidapi::HidDevice;

/// Raw report I/O with a controller.
#[cfg_attr(test, mockall::automock)]
pub trait DeviceIO: Send + 'static {
    fn write(&self, buf: &[u8]) -> Result<usize>;
    fn read(&self, buf: &mut [u8], timeout: i32) -> Result<()>;
}

impl DeviceIO for HidDevice {
    fn write(&self, buf: &[u8]) -> Result<usize> {
        Self::write(self, buf).map_err(|e| anyhow!("{e}"))
    }

    fn read(&self, buf: &mut [u8], timeout: i32) -> Result<()> {
        let n = Self::read_timeout(self, buf, timeout).map_err(|e| anyhow!("{e}"))?;
        if n == 0 {
            bail!("Incomplete read: no report within {timeout} ms");
        }
        Ok(())
    }
}

impl DeviceIO for Box<dyn DeviceIO> {
    fn write(&self, buf: &[u8]) -> Result<usize> {
        (**self).write(buf)
    }

    fn read(&self, buf: &mut [u8], timeout: i32) -> Result<()> {
        (**self).read(buf, timeout)
    }
}
