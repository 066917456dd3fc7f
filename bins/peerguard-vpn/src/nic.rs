//! TUN device wrapper
//!
//! Thin async wrapper over the `tun` crate: bring the device up with the
//! overlay IPv4 address and shovel raw L3 frames. Address management
//! beyond the initial assignment is left to the operator.

use std::net::Ipv4Addr;

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tracing::info;

pub struct TunDevice {
    reader: Mutex<ReadHalf<tun::AsyncDevice>>,
    writer: Mutex<WriteHalf<tun::AsyncDevice>>,
    mtu: u16,
}

impl TunDevice {
    /// Create and bring up the TUN device.
    pub async fn create(
        name: &str,
        ipv4: Option<(Ipv4Addr, u8)>,
        mtu: u16,
    ) -> Result<Self> {
        let mut config = tun::Configuration::default();
        config.name(name).mtu(mtu as i32).up();
        if let Some((addr, prefix_len)) = ipv4 {
            config.address(addr).netmask(v4_netmask(prefix_len));
        }

        #[cfg(target_os = "linux")]
        config.platform(|platform| {
            platform.packet_information(false);
        });

        let device = tun::create_as_async(&config)
            .with_context(|| format!("create TUN device {name}"))?;
        info!("TUN device {} up, mtu {}", name, mtu);

        let (reader, writer) = tokio::io::split(device);
        Ok(Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            mtu,
        })
    }

    /// Read one L3 frame.
    pub async fn read_frame(&self) -> Result<Bytes> {
        let mut buf = vec![0u8; self.mtu as usize + 4];
        let n = self
            .reader
            .lock()
            .await
            .read(&mut buf)
            .await
            .context("read from TUN")?;
        buf.truncate(n);
        Ok(Bytes::from(buf))
    }

    /// Write one L3 frame.
    pub async fn write_frame(&self, frame: &[u8]) -> Result<()> {
        self.writer
            .lock()
            .await
            .write_all(frame)
            .await
            .context("write to TUN")?;
        Ok(())
    }
}

fn v4_netmask(prefix_len: u8) -> Ipv4Addr {
    let bits = if prefix_len == 0 {
        0
    } else {
        !0u32 << (32 - u32::from(prefix_len.min(32)))
    };
    Ipv4Addr::from(bits)
}
