use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::time::sleep;
use tracing::{debug, info, instrument, trace};

use crate::bitmap::{PackedBitmap, Raster};
use crate::config::DriverConfig;
use crate::connection::{Begin, ConnectionMachine, ConnectionState, Outcome};
use crate::error::{Error, Result};
use crate::events::{EventSink, PrinterEvent};
use crate::font::{rasterize_text, FontBook, TextStyle};
use crate::protocol::*;
use crate::transport::GattAdapter;

/// MXW01 printer driver.
///
/// - `adapter`: platform GATT binding (btleplug or a mock)
/// - `config`: timings and protocol constants
///
/// One driver owns at most one live session. `print` is not reentrant:
/// callers must not overlap two print jobs on the same driver.
pub struct CatPrinter<A: GattAdapter> {
    adapter: A,
    config: DriverConfig,
    machine: Arc<ConnectionMachine>,
    fonts: FontBook,
}

impl<A: GattAdapter> CatPrinter<A> {
    pub fn new(adapter: A, config: DriverConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            adapter,
            config,
            machine: ConnectionMachine::new(EventSink::new()),
            fonts: FontBook::new(),
        })
    }

    /// Replace the typeface registry used by [`print_text`](Self::print_text).
    pub fn with_fonts(mut self, fonts: FontBook) -> Self {
        self.fonts = fonts;
        self
    }

    pub fn fonts_mut(&mut self) -> &mut FontBook {
        &mut self.fonts
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.machine.state()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// Address of the current (or pending) session.
    pub fn address(&self) -> Option<String> {
        self.machine.address()
    }

    /// Status, failure and completion events.
    pub fn subscribe(&self) -> broadcast::Receiver<PrinterEvent> {
        self.machine.events().subscribe()
    }

    /// Connect to the printer at `address` and wait until it is ready.
    ///
    /// - no-op when already ready
    /// - tears down any other session or pending attempt first
    /// - fails with [`Error::ConnectTimeout`] if the printer is not ready
    ///   within `connect_timeout_ms`; the state is then back to Disconnected
    #[instrument(skip(self))]
    pub async fn connect(&self, address: &str) -> Result<()> {
        let address = address.trim();
        if address.is_empty() {
            return Err(self.report(Error::InvalidAddress(address.to_string())));
        }

        let attempt = match self.machine.begin(address) {
            Begin::AlreadyReady => {
                debug!("already ready");
                return Ok(());
            }
            Begin::Started { attempt, stale } => {
                if let Some(link) = stale {
                    link.close();
                }
                attempt
            }
        };
        self.machine.events().status(format!("Connecting to {}...", address));

        let timeout = self.config.connect_timeout();
        match tokio::time::timeout(timeout, self.establish(address, attempt)).await {
            Ok(Ok(())) => {
                info!("connected");
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                self.machine.abort(attempt);
                Err(self.report(Error::ConnectTimeout(self.config.connect_timeout_ms)))
            }
        }
    }

    async fn establish(&self, address: &str, attempt: u64) -> Result<()> {
        let callbacks = self.machine.callbacks(attempt);
        let link = match self.adapter.open(address, callbacks).await {
            Ok(link) => link,
            Err(e) => {
                self.machine.abort(attempt);
                return Err(self.report(e));
            }
        };
        if !self.machine.attach(attempt, link.clone()) {
            link.close();
            return Err(self.report(Error::LinkLost("connect attempt superseded".into())));
        }
        if let Err(e) = link.connect() {
            self.machine.abort(attempt);
            return Err(self.report(e));
        }

        // Callbacks drive the state; poll it
        loop {
            match self.machine.outcome(attempt) {
                Outcome::Ready => return Ok(()),
                Outcome::Failed { error, reported: true } => return Err(error),
                Outcome::Failed { error, reported: false } => return Err(self.report(error)),
                Outcome::Pending => sleep(self.config.connect_poll()).await,
            }
        }
    }

    /// Drop the session. Safe to call when already disconnected.
    #[instrument(skip(self))]
    pub async fn disconnect(&self) -> Result<()> {
        if self.machine.teardown() {
            info!("disconnected");
            self.machine.events().status("Disconnected");
        }
        Ok(())
    }

    /// Render `text` and print it.
    #[instrument(skip(self, text), fields(chars = text.chars().count()))]
    pub async fn print_text(&self, text: &str, style: &TextStyle) -> Result<()> {
        if !self.is_ready() {
            return Err(self.report(Error::NotConnected));
        }
        let face = self.fonts.resolve(&style.family).map_err(|e| self.report(e))?;
        let raster = rasterize_text(text, style, face.as_ref(), self.config.printer_width)
            .map_err(|e| self.report(e))?;
        self.print(&raster).await
    }

    /// Print a black/white raster.
    ///
    /// Sequence: intensity command, print-setup command with the row count,
    /// raw bitmap chunks on the data characteristic, finalize command.
    /// Any failure aborts the job and tears the session down; reconnect and
    /// issue a fresh `print`.
    #[instrument(skip_all, fields(width = raster.width(), height = raster.height()))]
    pub async fn print(&self, raster: &Raster) -> Result<()> {
        self.machine.ready_link().map_err(|e| self.report(e))?;
        if raster.width() != self.config.printer_width {
            return Err(self.report(Error::RasterWidth {
                width: raster.width(),
                expected: self.config.printer_width,
            }));
        }
        let rows = u16::try_from(raster.height())
            .map_err(|_| self.report(Error::TooManyRows(raster.height())))?;

        let packed = PackedBitmap::encode(raster);
        self.machine.events().status("Printing...");
        match self.run_job(&packed, rows).await {
            Ok(()) => {
                info!(rows, bytes = packed.len(), "print complete");
                self.machine.events().completed();
                Ok(())
            }
            Err(e) => {
                self.machine
                    .events()
                    .failure(e.kind(), format!("Print error: {}", e));
                self.machine.teardown();
                Err(e)
            }
        }
    }

    async fn run_job(&self, packed: &PackedBitmap, rows: u16) -> Result<()> {
        self.send_command(CMD_INTENSITY, &[self.config.intensity])
            .await?;
        self.send_command(
            CMD_PRINT_SETUP,
            &print_setup_payload(rows, self.config.print_setup_trailer),
        )
        .await?;

        let chunks = chunk_data(packed.as_bytes(), self.config.chunk_size);
        info!(chunks = chunks.len(), "streaming bitmap");
        for (i, chunk) in chunks.iter().enumerate() {
            let ready = self.machine.ready_link()?;
            ready.link.write(&ready.data_char, chunk).await?;
            trace!(chunk = i, len = chunk.len(), "data chunk written");
            sleep(self.config.chunk_delay()).await;
        }

        self.send_command(CMD_FINALIZE, &[self.config.finalize_payload])
            .await
    }

    /// Frame and write one command, then wait the command pacing delay.
    async fn send_command(&self, opcode: u8, payload: &[u8]) -> Result<()> {
        let ready = self.machine.ready_link()?;
        let frame = build_control_packet(opcode, payload)?;
        debug!(opcode = %format!("{:#04x}", opcode), frame = %hex(&frame), "command");
        ready.link.write(&ready.write_char, &frame).await?;
        sleep(self.config.command_delay()).await;
        Ok(())
    }

    /// Broadcast a failure and hand it back for returning.
    fn report(&self, err: Error) -> Error {
        self.machine.events().failure(err.kind(), err.to_string());
        err
    }
}

impl<A: GattAdapter> Drop for CatPrinter<A> {
    fn drop(&mut self) {
        self.machine.teardown();
    }
}
