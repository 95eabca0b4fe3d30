//! Tokio transport pump.
//!
//! `TcpLink` owns the socket and drives a [`PgDriver`]: pending output is
//! flushed, then the pump waits on socket readability or the engine's
//! auto-sync deadline, whichever comes first. The engine never blocks, so one
//! task per connection is all it takes.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep_until, timeout, Instant as TokioInstant};

use crate::driver::{ConnState, Driver};
use crate::error::{Error, Result};
use crate::pg::driver::PgDriver;

pub struct TcpLink {
    stream: TcpStream,
}

impl TcpLink {
    /// Open the TCP transport for `driver`'s configured address, honoring the
    /// configured connect timeout.
    pub async fn establish(driver: &PgDriver) -> Result<Self> {
        let address = driver.config().address();
        let connect = TcpStream::connect(&address);
        let stream = match driver.config().connect_timeout {
            Some(limit) => timeout(limit, connect)
                .await
                .map_err(|_| Error::Config(format!("connect timeout to {}", address)))??,
            None => connect.await?,
        };
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }

    /// Drive the engine until it disconnects.
    pub async fn run(mut self, driver: &mut PgDriver) -> Result<()> {
        let mut read_buf = [0u8; 16 * 1024];
        loop {
            // Flush before the state check so a Terminate written by `close`
            // reaches the server.
            while let Some(chunk) = driver.take_wire_output() {
                self.stream.write_all(&chunk).await?;
            }
            if driver.state() == ConnState::Disconnected {
                return Ok(());
            }

            match driver.timer_deadline() {
                Some(deadline) => {
                    let deadline = TokioInstant::from_std(deadline);
                    tokio::select! {
                        read = self.stream.read(&mut read_buf) => {
                            Self::apply_read(driver, &read_buf, read)?;
                        }
                        _ = sleep_until(deadline) => driver.fire_timer(),
                    }
                }
                None => {
                    let read = self.stream.read(&mut read_buf).await;
                    Self::apply_read(driver, &read_buf, read)?;
                }
            }
        }
    }

    fn apply_read(
        driver: &mut PgDriver,
        buf: &[u8],
        read: std::io::Result<usize>,
    ) -> Result<()> {
        match read {
            Ok(0) => {
                driver.wire_closed("server closed the connection");
                Ok(())
            }
            Ok(n) => {
                driver.wire_input(&buf[..n]);
                Ok(())
            }
            Err(error) => {
                driver.wire_closed(&error.to_string());
                Err(error.into())
            }
        }
    }
}
