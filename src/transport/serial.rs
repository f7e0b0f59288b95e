use std::io::{Read, Write};
use std::time::Duration;

use serialport::{ClearBuffer, SerialPort};
use tracing::trace;

use crate::error::TransportError;
use crate::transport::ByteStream;

/// Serial link with manual DTR control. The STK500v2 engine toggles DTR
/// itself to reset the target, so the port is opened with DTR deasserted.
pub struct SerialLink {
    port: Box<dyn SerialPort>,
    name: String,
}

impl SerialLink {
    pub fn open(name: &str, baud: u32) -> Result<SerialLink, TransportError> {
        let port = serialport::new(name, baud)
            .timeout(Duration::from_millis(100))
            .dtr_on_open(false)
            .open()
            .map_err(|e| classify_open_error(name, e))?;

        Ok(SerialLink {
            port,
            name: name.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

fn classify_open_error(name: &str, err: serialport::Error) -> TransportError {
    match err.kind() {
        serialport::ErrorKind::NoDevice | serialport::ErrorKind::InvalidInput => {
            TransportError::InvalidPort(name.to_string())
        }
        serialport::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
            TransportError::PortBusy(name.to_string())
        }
        _ => TransportError::OpenFailed(name.to_string()),
    }
}

impl ByteStream for SerialLink {
    fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.port.write_all(data)?;
        self.port.flush()?;
        trace!("Sent bytes {:02x?}", data);
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        self.port.set_timeout(timeout)?;
        match self.port.read(buf) {
            Ok(n) => {
                trace!("Received bytes {:02x?}", &buf[..n]);
                Ok(n)
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(TransportError::Io(e)),
        }
    }

    fn set_dtr(&mut self, level: bool) -> Result<(), TransportError> {
        self.port.write_data_terminal_ready(level)?;
        Ok(())
    }

    fn discard_input(&mut self) -> Result<(), TransportError> {
        self.port.clear(ClearBuffer::All)?;
        Ok(())
    }
}

/// Find the first serial port whose USB product id matches one of the
/// given candidates. Used to locate a board when no port was specified.
pub fn find_port_by_product_id(product_ids: &[u16]) -> Result<Option<String>, TransportError> {
    let ports = serialport::available_ports()?;
    for port in ports {
        if let serialport::SerialPortType::UsbPort(info) = port.port_type {
            if product_ids.contains(&info.pid) {
                return Ok(Some(port.port_name));
            }
        }
    }
    Ok(None)
}
