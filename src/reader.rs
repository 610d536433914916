//! Register-block reading: transport trait, TCP implementation, and the
//! batch decoder that turns raw words into named results.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use tokio_modbus::client::{Context, Reader, tcp};
use tokio_modbus::slave::{Slave, SlaveContext};
use tracing::{debug, info};

use crate::error::FronmodError;
use crate::registers::{ReadBatch, ReadResult, ResultMap, decode_value};

/// Raw register access for one batch. The poll loop treats a read as an
/// opaque, potentially slow call; timeout policy lives behind this trait.
pub trait RegisterSource {
    /// Reads the batch's register block and returns `batch.len` words.
    fn read_block(&mut self, batch: &ReadBatch) -> Result<Vec<u16>, FronmodError>;

    /// Drops and re-establishes the underlying connection, where there is one.
    fn reconnect(&mut self) -> Result<(), FronmodError> {
        Ok(())
    }
}

/// Decodes batches into result mappings on top of any [`RegisterSource`].
pub struct BatchReader<S> {
    source: S,
}

impl<S: RegisterSource> BatchReader<S> {
    /// Wraps a register source.
    pub fn new(source: S) -> Self {
        Self { source }
    }

    /// The underlying source.
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Mutable access to the underlying source (used for reconnects).
    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    /// Reads and decodes one batch.
    ///
    /// Register-backed items become ready results; derived-only items become
    /// not-ready placeholders for later pipeline steps.
    ///
    /// # Errors
    ///
    /// Fails on transport errors, short blocks, out-of-range items, and
    /// duplicate item names (a configuration defect).
    pub fn read(&mut self, batch: &'static ReadBatch) -> Result<ResultMap, FronmodError> {
        let words = self.source.read_block(batch)?;
        if words.len() < batch.len as usize {
            return Err(FronmodError::ShortRead {
                batch: batch.name,
                got: words.len(),
                want: batch.len as usize,
            });
        }

        let mut results = HashMap::with_capacity(batch.items.len());
        for item in batch.items {
            let result = if item.offset.is_some() {
                ReadResult::decoded(item, decode_value(item, &words)?)
            } else {
                ReadResult::placeholder(item)
            };
            if results.insert(item.name, result).is_some() {
                return Err(FronmodError::DuplicateName(item.name));
            }
        }
        Ok(results)
    }
}

/// Modbus TCP register source.
///
/// Runs tokio-modbus on a private current-thread runtime so the poll loop
/// stays synchronous. The slave id is switched per batch — the Datamanager
/// exposes the inverter on unit 1 and the smart meter on unit 240 over one
/// connection.
pub struct TcpRegisterSource {
    addr: SocketAddr,
    timeout: Duration,
    runtime: tokio::runtime::Runtime,
    ctx: Option<Context>,
}

impl TcpRegisterSource {
    /// Connects to the Datamanager at `addr`.
    ///
    /// # Errors
    ///
    /// Fails when the runtime cannot be built or the TCP connection is
    /// refused.
    pub fn connect(addr: SocketAddr, timeout: Duration) -> Result<Self, FronmodError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| FronmodError::Transport(err.to_string()))?;

        let mut source = Self {
            addr,
            timeout,
            runtime,
            ctx: None,
        };
        source.open()?;
        Ok(source)
    }

    fn open(&mut self) -> Result<(), FronmodError> {
        info!(addr = %self.addr, "connecting to modbus gateway");
        let ctx = self
            .runtime
            .block_on(tcp::connect(self.addr))
            .map_err(|err| FronmodError::Transport(err.to_string()))?;
        self.ctx = Some(ctx);
        Ok(())
    }
}

impl RegisterSource for TcpRegisterSource {
    fn read_block(&mut self, batch: &ReadBatch) -> Result<Vec<u16>, FronmodError> {
        let timeout = self.timeout;
        let ctx = self.ctx.as_mut().ok_or(FronmodError::NotConnected)?;
        ctx.set_slave(Slave(batch.unit_id));

        let response = self.runtime.block_on(async {
            tokio::time::timeout(timeout, ctx.read_holding_registers(batch.start, batch.len)).await
        });

        match response {
            Err(_) => Err(FronmodError::ReadTimeout { batch: batch.name }),
            Ok(Err(err)) => Err(FronmodError::Transport(err.to_string())),
            Ok(Ok(Err(code))) => Err(FronmodError::Exception {
                batch: batch.name,
                code: code.to_string(),
            }),
            Ok(Ok(Ok(words))) => {
                debug!(batch = batch.name, words = words.len(), "block read");
                Ok(words)
            }
        }
    }

    fn reconnect(&mut self) -> Result<(), FronmodError> {
        self.ctx = None;
        self.open()
    }
}
