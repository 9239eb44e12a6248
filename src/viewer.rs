use crate::{Channel, ExitCode, GlobalParams};
use log::info;
use std::{
    io::{self, Write},
    net::{Shutdown, TcpStream},
};

pub const PACKING_16BIT_TIME: u32 = 2;
pub const CHANNEL_TYPE_DDC: u32 = 1;
pub const VOLTAGE_LEVEL: u32 = 2;
pub const COMPLEX_DATA: u32 = 0;
pub const ADC_RESOLUTION_BITS: u32 = 16;

/// Control word sent ahead of every block so the viewer can scale and label
/// the data.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewControl {
    pub board_id: u32,
    pub clock_mhz: f64,
    pub decimation: u32,
    pub packing_mode: u32,
    pub channel_type: u32,
    pub center_freq_mhz: f64,
    pub voltage_level: u32,
    pub block_size: u32,
    pub real_complex: u32,
    pub adc_resolution: u32,
}

impl ViewControl {
    pub const ENCODED_LEN: usize = 8 * 4 + 2 * 8;

    pub fn for_channel(
        board_id: u32,
        channel: &Channel,
        global: &GlobalParams,
        block_size: usize,
    ) -> Self {
        Self {
            board_id,
            clock_mhz: global.clock_freq / 1e6,
            decimation: channel.decimation,
            packing_mode: PACKING_16BIT_TIME,
            channel_type: CHANNEL_TYPE_DDC,
            center_freq_mhz: channel.tuning_freq / 1e6,
            voltage_level: VOLTAGE_LEVEL,
            block_size: u32::try_from(block_size).unwrap_or(u32::MAX),
            real_complex: COMPLEX_DATA,
            adc_resolution: ADC_RESOLUTION_BITS,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::ENCODED_LEN);
        buf.extend_from_slice(&self.board_id.to_le_bytes());
        buf.extend_from_slice(&self.clock_mhz.to_le_bytes());
        buf.extend_from_slice(&self.decimation.to_le_bytes());
        buf.extend_from_slice(&self.packing_mode.to_le_bytes());
        buf.extend_from_slice(&self.channel_type.to_le_bytes());
        buf.extend_from_slice(&self.center_freq_mhz.to_le_bytes());
        buf.extend_from_slice(&self.voltage_level.to_le_bytes());
        buf.extend_from_slice(&self.block_size.to_le_bytes());
        buf.extend_from_slice(&self.real_complex.to_le_bytes());
        buf.extend_from_slice(&self.adc_resolution.to_le_bytes());
        buf
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ViewerError {
    #[error("invalid viewer parameter: {0}")]
    InvalidParam(String),

    #[error("cannot connect to viewer at {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
}

impl ViewerError {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Self::InvalidParam(_) => ExitCode::ViewerParam,
            Self::Connect { .. } => ExitCode::ViewerConnect,
        }
    }
}

/// Connection to a live display client.
pub trait ViewerLink: Send {
    /// Send at most `block_size` bytes of `data` behind the control word.
    fn send(&mut self, data: &[u8], block_size: usize, control: &ViewControl) -> io::Result<()>;

    fn close(&mut self);
}

/// Frames are `control word | payload length (u32 LE) | payload`.
pub struct TcpViewerLink {
    stream: Option<TcpStream>,
}

impl TcpViewerLink {
    pub fn connect(host: &str, port: u16) -> Result<Self, ViewerError> {
        if host.is_empty() || port == 0 {
            return Err(ViewerError::InvalidParam(format!("{}:{}", host, port)));
        }
        let addr = format!("{}:{}", host, port);
        let stream = TcpStream::connect((host, port)).map_err(|source| ViewerError::Connect {
            addr: addr.clone(),
            source,
        })?;
        let _ = stream.set_nodelay(true);
        info!("Connected to viewer at {}", addr);
        Ok(Self {
            stream: Some(stream),
        })
    }
}

impl ViewerLink for TcpViewerLink {
    fn send(&mut self, data: &[u8], block_size: usize, control: &ViewControl) -> io::Result<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        let payload = &data[..data.len().min(block_size)];
        let len = u32::try_from(payload.len())
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        let mut frame = control.encode();
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(payload);
        stream.write_all(&frame)
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

impl Drop for TcpViewerLink {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DataSource;
    use std::{io::Read, net::TcpListener};

    fn control() -> ViewControl {
        let channel = Channel {
            index: 0,
            tuning_freq: 20e6,
            decimation: 16,
            data_source: DataSource::Adc1,
            trigger_delay: 10,
            viewer: true,
        };
        let global = GlobalParams {
            clock_freq: 200e6,
            board_channels: 4,
        };
        ViewControl::for_channel(0x71620, &channel, &global, 8)
    }

    #[test]
    fn control_word_describes_ddc_data() {
        let c = control();
        assert_eq!(c.clock_mhz, 200.0);
        assert_eq!(c.center_freq_mhz, 20.0);
        assert_eq!(c.packing_mode, 2);
        assert_eq!(c.adc_resolution, 16);
        let bytes = c.encode();
        assert_eq!(bytes.len(), ViewControl::ENCODED_LEN);
        assert_eq!(&bytes[..4], &0x71620u32.to_le_bytes());
    }

    #[test]
    fn sends_truncated_block_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut link = TcpViewerLink::connect("127.0.0.1", port).unwrap();
        let (mut peer, _) = listener.accept().unwrap();

        let data: Vec<u8> = (0..32).collect();
        link.send(&data, 8, &control()).unwrap();
        link.close();
        assert!(link.send(&data, 8, &control()).is_err());

        let mut frame = Vec::new();
        peer.read_to_end(&mut frame).unwrap();
        let header = ViewControl::ENCODED_LEN;
        assert_eq!(frame.len(), header + 4 + 8);
        assert_eq!(&frame[header..header + 4], &8u32.to_le_bytes());
        assert_eq!(&frame[header + 4..], &data[..8]);
    }

    #[test]
    fn connect_errors_map_to_exit_codes() {
        let err = TcpViewerLink::connect("127.0.0.1", 0).err().unwrap();
        assert_eq!(err.exit_code(), ExitCode::ViewerParam);

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let err = TcpViewerLink::connect("127.0.0.1", port).err().unwrap();
        assert_eq!(err.exit_code(), ExitCode::ViewerConnect);
    }
}
