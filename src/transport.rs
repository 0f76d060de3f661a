use crate::prelude::*;

use {
    async_trait::async_trait,
    net2::TcpStreamExt,
    std::time::Duration,
    tokio_modbus::client::{rtu, tcp, Client as _, Context, Reader as _, Writer as _},
    tokio_modbus::{slave::Slave, ExceptionCode},
    tokio_serial::SerialPortBuilderExt,
};

const TCP_KEEPALIVE_SECS: u64 = 60;

/// The four primitives every Modbus link offers. Implemented over
/// tokio-modbus for real devices and by scripted fakes in tests.
#[async_trait]
pub trait Transport: Send {
    async fn connect(&mut self) -> Result<(), TransactionError>;
    async fn disconnect(&mut self) -> Result<(), TransactionError>;
    async fn read_holding_registers(&mut self, start: u16, count: u16) -> Result<Vec<u16>, TransactionError>;
    async fn write_multiple_registers(&mut self, start: u16, words: &[u16]) -> Result<(), TransactionError>;
    fn describe(&self) -> String;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    None,
    Even,
    Odd,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Link {
    Tcp {
        host: String,
        port: u16,
        nodelay: bool,
    },
    Rtu {
        path: String,
        baud_rate: u32,
        parity: Parity,
        data_bits: u8,
        stop_bits: u8,
    },
}

pub struct ModbusTransport {
    link: Link,
    slave: u8,
    context: Option<Context>,
}

impl ModbusTransport {
    pub fn new(link: Link, slave: u8) -> Self {
        Self {
            link,
            slave,
            context: None,
        }
    }

    /// Takes owned arguments so `connect` never holds `&self` across an await;
    /// the context is `Send` but not `Sync`.
    async fn open_tcp(name: String, slave: u8, host: String, port: u16, nodelay: bool) -> std::io::Result<Context> {
        let stream = tokio::net::TcpStream::connect((host.as_str(), port)).await?;

        let std_stream = stream.into_std()?;
        if let Err(e) = std_stream.set_keepalive(Some(Duration::new(TCP_KEEPALIVE_SECS, 0))) {
            warn!("{}: failed to set TCP keepalive: {}", name, e);
        }
        let stream = tokio::net::TcpStream::from_std(std_stream)?;

        if nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                warn!("{}: failed to set TCP_NODELAY: {}", name, e);
            }
        }

        Ok(tcp::attach_slave(stream, Slave(slave)))
    }

    fn open_rtu(&self, path: &str, baud_rate: u32, parity: Parity, data_bits: u8, stop_bits: u8) -> Result<Context, tokio_serial::Error> {
        let port = tokio_serial::new(path, baud_rate)
            .parity(match parity {
                Parity::None => tokio_serial::Parity::None,
                Parity::Even => tokio_serial::Parity::Even,
                Parity::Odd => tokio_serial::Parity::Odd,
            })
            .data_bits(match data_bits {
                5 => tokio_serial::DataBits::Five,
                6 => tokio_serial::DataBits::Six,
                7 => tokio_serial::DataBits::Seven,
                _ => tokio_serial::DataBits::Eight,
            })
            .stop_bits(match stop_bits {
                2 => tokio_serial::StopBits::Two,
                _ => tokio_serial::StopBits::One,
            })
            .open_native_async()?;

        Ok(rtu::attach_slave(port, Slave(self.slave)))
    }

    fn context(&mut self) -> Result<&mut Context, TransactionError> {
        self.context.as_mut().ok_or(TransactionError::NotConnected)
    }
}

#[async_trait]
impl Transport for ModbusTransport {
    async fn connect(&mut self) -> Result<(), TransactionError> {
        if let Some(mut context) = self.context.take() {
            let _ = context.disconnect().await;
        }

        let context = match self.link.clone() {
            Link::Tcp { host, port, nodelay } => {
                let (name, slave) = (self.describe(), self.slave);
                Self::open_tcp(name, slave, host, port, nodelay)
                    .await
                    .map_err(|e| TransactionError::TransportUnavailable(e.to_string()))?
            }
            Link::Rtu {
                path,
                baud_rate,
                parity,
                data_bits,
                stop_bits,
            } => self
                .open_rtu(&path, baud_rate, parity, data_bits, stop_bits)
                .map_err(|e| TransactionError::TransportUnavailable(e.to_string()))?,
        };

        debug!("{}: link open", self.describe());
        self.context = Some(context);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransactionError> {
        if let Some(mut context) = self.context.take() {
            context
                .disconnect()
                .await
                .map_err(|e| TransactionError::LinkLost(e.to_string()))?;
        }
        Ok(())
    }

    async fn read_holding_registers(&mut self, start: u16, count: u16) -> Result<Vec<u16>, TransactionError> {
        let reply = self.context()?.read_holding_registers(start, count).await;
        map_reply(reply)
    }

    async fn write_multiple_registers(&mut self, start: u16, words: &[u16]) -> Result<(), TransactionError> {
        let reply = self.context()?.write_multiple_registers(start, words).await;
        map_reply(reply)
    }

    fn describe(&self) -> String {
        match &self.link {
            Link::Tcp { host, port, .. } => format!("{}:{}/{}", host, port, self.slave),
            Link::Rtu { path, .. } => format!("{}/{}", path, self.slave),
        }
    }
}

fn map_reply<T>(reply: Result<Result<T, ExceptionCode>, tokio_modbus::Error>) -> Result<T, TransactionError> {
    match reply {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(exception)) => Err(TransactionError::ProtocolError(exception_code(exception))),
        Err(tokio_modbus::Error::Transport(e)) if e.kind() == std::io::ErrorKind::TimedOut => {
            Err(TransactionError::Timeout(Duration::ZERO))
        }
        // a framing mismatch leaves the stream out of step, same as a dropped socket
        Err(e) => Err(TransactionError::LinkLost(e.to_string())),
    }
}

fn exception_code(code: ExceptionCode) -> u8 {
    match code {
        ExceptionCode::IllegalFunction => 0x01,
        ExceptionCode::IllegalDataAddress => 0x02,
        ExceptionCode::IllegalDataValue => 0x03,
        ExceptionCode::ServerDeviceFailure => 0x04,
        ExceptionCode::Acknowledge => 0x05,
        ExceptionCode::ServerDeviceBusy => 0x06,
        ExceptionCode::MemoryParityError => 0x08,
        ExceptionCode::GatewayPathUnavailable => 0x0a,
        ExceptionCode::GatewayTargetDevice => 0x0b,
        _ => 0xff,
    }
}
