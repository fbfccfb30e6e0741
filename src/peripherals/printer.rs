use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, info};

use super::{PrinterConfig, UnavailableReason};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

// ESC/POS command bytes
const INIT: &[u8] = &[0x1B, 0x40];
const ALIGN_LEFT: &[u8] = &[0x1B, 0x61, 0x00];
const ALIGN_CENTER: &[u8] = &[0x1B, 0x61, 0x01];
const BOLD_ON: &[u8] = &[0x1B, 0x45, 0x01];
const BOLD_OFF: &[u8] = &[0x1B, 0x45, 0x00];
/// Feed and partial cut
const CUT: &[u8] = &[0x1D, 0x56, 0x42, 0x00];
/// Pulse drawer pin 2 for 50ms on, 500ms off
const KICK_DRAWER: &[u8] = &[0x1B, 0x70, 0x00, 0x19, 0xFA];

/// Plain text receipt. The title is printed centered and bold.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Receipt {
  pub title: Option<String>,
  pub lines: Vec<String>,
}

impl Receipt {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn title(mut self, title: impl Into<String>) -> Self {
    self.title = Some(title.into());
    self
  }

  pub fn line(mut self, line: impl Into<String>) -> Self {
    self.lines.push(line.into());
    self
  }

  /// Encode as ESC/POS. Characters outside ASCII are printed as `?`.
  pub fn to_escpos(&self) -> Vec<u8> {
    let mut out = Vec::new();
    if let Some(title) = &self.title {
      out.extend_from_slice(ALIGN_CENTER);
      out.extend_from_slice(BOLD_ON);
      push_text(&mut out, title);
      out.extend_from_slice(BOLD_OFF);
      out.extend_from_slice(ALIGN_LEFT);
    }
    for line in &self.lines {
      push_text(&mut out, line);
    }
    out
  }
}

fn push_text(out: &mut Vec<u8>, text: &str) {
  out.extend(text.chars().map(|c| {
    if c.is_ascii() && !c.is_ascii_control() {
      c as u8
    } else {
      b'?'
    }
  }));
  out.push(b'\n');
}

/// Receipt printer backend selected from configuration.
///
/// Every operation dispatches on the variant; only the network transport is
/// implemented, the others report why they cannot be used.
#[derive(Debug)]
pub enum PrinterTransport {
  Network {
    addr: String,
    stream: Option<TcpStream>,
  },
  Usb {
    device: String,
  },
  Bluetooth {
    address: String,
  },
  None,
}

impl PrinterTransport {
  pub fn from_config(config: &PrinterConfig) -> Self {
    match config {
      PrinterConfig::None => PrinterTransport::None,
      PrinterConfig::Network { address } => PrinterTransport::Network {
        addr: address.clone(),
        stream: None,
      },
      PrinterConfig::Usb { device } => PrinterTransport::Usb {
        device: device.clone(),
      },
      PrinterConfig::Bluetooth { address } => PrinterTransport::Bluetooth {
        address: address.clone(),
      },
    }
  }

  pub fn kind(&self) -> &'static str {
    match self {
      PrinterTransport::Network { .. } => "network",
      PrinterTransport::Usb { .. } => "usb",
      PrinterTransport::Bluetooth { .. } => "bluetooth",
      PrinterTransport::None => "none",
    }
  }

  /// Connect and reset the printer.
  pub async fn open(&mut self) -> Result<(), UnavailableReason> {
    match self {
      PrinterTransport::Network { addr, stream } => {
        let mut conn = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr.as_str()))
          .await
          .map_err(|_| UnavailableReason::Failed(format!("printer {} did not answer", addr)))?
          .map_err(|e| UnavailableReason::Failed(format!("printer {}: {}", addr, e)))?;
        conn
          .write_all(INIT)
          .await
          .map_err(|e| UnavailableReason::Failed(format!("printer {}: {}", addr, e)))?;
        info!(addr = %addr, "receipt printer connected");
        *stream = Some(conn);
        Ok(())
      }
      PrinterTransport::Usb { device } => {
        debug!(device = %device, "usb printers are not supported");
        Err(UnavailableReason::Unsupported("usb printer"))
      }
      PrinterTransport::Bluetooth { address } => {
        debug!(address = %address, "bluetooth printers are not supported");
        Err(UnavailableReason::Unsupported("bluetooth printer"))
      }
      PrinterTransport::None => Err(UnavailableReason::NotConfigured),
    }
  }

  pub async fn render(&mut self, receipt: &Receipt) -> Result<(), UnavailableReason> {
    self.send(&receipt.to_escpos()).await
  }

  pub async fn cut(&mut self) -> Result<(), UnavailableReason> {
    self.send(CUT).await
  }

  pub async fn kick_drawer(&mut self) -> Result<(), UnavailableReason> {
    self.send(KICK_DRAWER).await
  }

  async fn send(&mut self, bytes: &[u8]) -> Result<(), UnavailableReason> {
    match self {
      PrinterTransport::Network { addr, stream } => {
        let conn = stream
          .as_mut()
          .ok_or_else(|| UnavailableReason::Failed(format!("printer {} is not open", addr)))?;
        let written = async {
          conn.write_all(bytes).await?;
          conn.flush().await
        }
        .await;
        if let Err(e) = written {
          // Force a reconnect on the next open
          *stream = None;
          return Err(UnavailableReason::Failed(format!("printer {}: {}", addr, e)));
        }
        Ok(())
      }
      PrinterTransport::Usb { .. } => Err(UnavailableReason::Unsupported("usb printer")),
      PrinterTransport::Bluetooth { .. } => Err(UnavailableReason::Unsupported("bluetooth printer")),
      PrinterTransport::None => Err(UnavailableReason::NotConfigured),
    }
  }
}
