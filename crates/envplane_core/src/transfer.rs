//! Transferência em bloco dos dados de probes (canal TCP).
//!
//! Formato do stream:
//!
//! ```text
//! ┌──────────────────┬───────────────────────────┐
//! │ Length (4 bytes) │ Arquivo zip (Length bytes) │
//! │ Big-endian u32   │                           │
//! └──────────────────┴───────────────────────────┘
//! ```
//!
//! [`Transfer`] é a máquina de estados de uma transferência. Ela não faz
//! I/O de rede por conta própria: o loop do plano chama
//! [`Transfer::on_readable`] a cada notificação de prontidão do socket e
//! agenda [`Transfer::extract`] como tarefa ociosa quando o corpo termina.
//!
//! Fases: `Connecting → ReadingHeader → ReadingBody → Extracting → Done`,
//! com `Failed` e `Aborted` como saídas terminais alternativas. A callback
//! de conclusão é chamada exatamente uma vez, em qualquer saída.

use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::archive::extract_archive;
use crate::error::{PlaneError, Result};

/// Leitura máxima por notificação de prontidão.
pub const CHUNK_SIZE: usize = 4096;

const LENGTH_HEADER: usize = 4;

/// Fase da transferência.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPhase {
    Connecting,
    ReadingHeader,
    ReadingBody,
    Extracting,
    Done,
    Failed,
    Aborted,
}

impl TransferPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransferPhase::Done | TransferPhase::Failed | TransferPhase::Aborted)
    }

    /// Fases em que o socket ainda precisa ser lido.
    pub fn is_reading(self) -> bool {
        matches!(self, TransferPhase::ReadingHeader | TransferPhase::ReadingBody)
    }
}

/// Progresso reportado após o header e após cada bloco.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    pub received: u64,
    pub total: u64,
}

/// Resultado de uma transferência concluída.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSummary {
    pub destination: PathBuf,
    pub bytes: u64,
    pub entries: usize,
}

pub type ProgressCallback = Box<dyn FnMut(TransferProgress)>;
pub type CompletionCallback = Box<dyn FnOnce(Result<TransferSummary>)>;

/// Token compartilhado para cancelar uma transferência em andamento.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// O que aconteceu em uma chamada a [`Transfer::on_readable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Nada disponível no socket.
    Idle,
    /// Bytes consumidos; ainda há o que ler.
    Progressed,
    /// Corpo completo: fechar o socket e agendar a extração.
    BodyComplete,
    /// Transferência terminou (falha ou cancelamento).
    Finished,
}

/// Estado de uma transferência.
pub struct Transfer {
    phase: TransferPhase,
    destination: PathBuf,
    header: [u8; LENGTH_HEADER],
    header_len: usize,
    total: u64,
    remaining: u64,
    spool: Option<File>,
    buf: Vec<u8>,
    on_progress: Option<ProgressCallback>,
    on_complete: Option<CompletionCallback>,
    cancel: CancelToken,
    idle_timeout: Option<Duration>,
    last_activity: Instant,
}

impl Transfer {
    /// Prepara a transferência e o spool temporário. Começa em `Connecting`.
    pub fn new(
        destination: impl Into<PathBuf>,
        on_progress: Option<ProgressCallback>,
        on_complete: Option<CompletionCallback>,
    ) -> Result<Self> {
        Ok(Self {
            phase: TransferPhase::Connecting,
            destination: destination.into(),
            header: [0; LENGTH_HEADER],
            header_len: 0,
            total: 0,
            remaining: 0,
            spool: Some(tempfile::tempfile()?),
            buf: vec![0; CHUNK_SIZE],
            on_progress,
            on_complete,
            cancel: CancelToken::default(),
            idle_timeout: None,
            last_activity: Instant::now(),
        })
    }

    /// Tempo máximo sem receber bytes antes de desistir. `None` desativa.
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn phase(&self) -> TransferPhase {
        self.phase
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Conexão estabelecida: passa a esperar o header.
    pub fn connected(&mut self) {
        if self.phase == TransferPhase::Connecting {
            self.phase = TransferPhase::ReadingHeader;
            self.last_activity = Instant::now();
            debug!("Transferência conectada, aguardando header");
        }
    }

    /// Um passo de leitura. Lê apenas o que já está disponível em `src`
    /// (que deve ser não bloqueante) e no máximo [`CHUNK_SIZE`] bytes do corpo.
    pub fn on_readable<R: Read>(&mut self, src: &mut R) -> Readiness {
        if self.poll_cancel() {
            return Readiness::Finished;
        }

        match self.phase {
            TransferPhase::ReadingHeader => self.read_header(src),
            TransferPhase::ReadingBody => self.read_body(src),
            TransferPhase::Extracting => Readiness::BodyComplete,
            TransferPhase::Connecting => Readiness::Idle,
            TransferPhase::Done | TransferPhase::Failed | TransferPhase::Aborted => Readiness::Finished,
        }
    }

    fn read_header<R: Read>(&mut self, src: &mut R) -> Readiness {
        let mut progressed = false;
        while self.header_len < LENGTH_HEADER {
            match src.read(&mut self.header[self.header_len..]) {
                Ok(0) => {
                    self.fail(std::io::Error::from(ErrorKind::UnexpectedEof).into());
                    return Readiness::Finished;
                }
                Ok(n) => {
                    self.header_len += n;
                    self.last_activity = Instant::now();
                    progressed = true;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    return if progressed { Readiness::Progressed } else { Readiness::Idle };
                }
                Err(e) => {
                    self.fail(e.into());
                    return Readiness::Finished;
                }
            }
        }

        self.total = u32::from_be_bytes(self.header) as u64;
        self.remaining = self.total;
        debug!("Transferência de probes: tamanho = {}", self.total);
        self.report_progress();

        if self.remaining == 0 {
            self.phase = TransferPhase::Extracting;
            return Readiness::BodyComplete;
        }

        self.phase = TransferPhase::ReadingBody;
        Readiness::Progressed
    }

    fn read_body<R: Read>(&mut self, src: &mut R) -> Readiness {
        let to_read = self.remaining.min(CHUNK_SIZE as u64) as usize;
        let n = loop {
            match src.read(&mut self.buf[..to_read]) {
                Ok(0) => {
                    let remaining = self.remaining;
                    self.fail(PlaneError::TransferTruncated { remaining });
                    return Readiness::Finished;
                }
                Ok(n) => break n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Readiness::Idle,
                Err(e) => {
                    self.fail(e.into());
                    return Readiness::Finished;
                }
            }
        };

        let written = match self.spool.as_mut() {
            Some(spool) => spool.write_all(&self.buf[..n]),
            None => Err(std::io::Error::other("spool já descartado")),
        };
        if let Err(e) = written {
            self.fail(e.into());
            return Readiness::Finished;
        }

        self.remaining -= n as u64;
        self.last_activity = Instant::now();
        self.report_progress();
        debug!("Dados recebidos, {} restantes", self.remaining);

        if self.remaining == 0 {
            self.phase = TransferPhase::Extracting;
            return Readiness::BodyComplete;
        }
        Readiness::Progressed
    }

    /// Extrai o spool no destino e chama a callback de conclusão.
    /// Só tem efeito na fase `Extracting`.
    pub fn extract(&mut self) {
        if self.phase != TransferPhase::Extracting {
            warn!("Extração pedida na fase {:?}, ignorando", self.phase);
            return;
        }

        debug!("Extraindo arquivo de probes em {}", self.destination.display());
        let result = self.unpack_spool();
        self.spool = None;

        match result {
            Ok(entries) => {
                self.phase = TransferPhase::Done;
                info!(
                    "Transferência concluída: {} bytes, {} entradas em {}",
                    self.total,
                    entries,
                    self.destination.display()
                );
                self.complete(Ok(TransferSummary {
                    destination: self.destination.clone(),
                    bytes: self.total,
                    entries,
                }));
            }
            Err(e) => {
                self.phase = TransferPhase::Failed;
                error!("Falha ao extrair dados de probes: {e}");
                self.complete(Err(e));
            }
        }
    }

    fn unpack_spool(&mut self) -> Result<usize> {
        let Some(spool) = self.spool.as_mut() else {
            return Err(std::io::Error::other("spool já descartado").into());
        };
        spool.seek(SeekFrom::Start(0))?;
        extract_archive(spool, &self.destination)
    }

    /// Verifica o token de cancelamento; aborta se foi acionado.
    pub fn poll_cancel(&mut self) -> bool {
        if self.cancel.is_cancelled() && !self.phase.is_terminal() {
            self.abort();
            return true;
        }
        false
    }

    /// Falha a transferência se ficou sem receber bytes além do limite.
    pub fn check_timeout(&mut self, now: Instant) -> bool {
        let Some(timeout) = self.idle_timeout else {
            return false;
        };
        if self.phase.is_reading() && now.saturating_duration_since(self.last_activity) > timeout {
            self.fail(PlaneError::TransferTimeout(timeout));
            return true;
        }
        false
    }

    /// Encerra a transferência sem extrair; o spool é descartado.
    pub fn abort(&mut self) {
        if self.phase.is_terminal() {
            return;
        }
        info!("Transferência cancelada na fase {:?}", self.phase);
        self.phase = TransferPhase::Aborted;
        self.spool = None;
        self.complete(Err(PlaneError::TransferAborted));
    }

    fn fail(&mut self, err: PlaneError) {
        error!("Transferência falhou na fase {:?}: {err}", self.phase);
        self.phase = TransferPhase::Failed;
        self.spool = None;
        self.complete(Err(err));
    }

    fn report_progress(&mut self) {
        let progress = TransferProgress {
            received: self.total - self.remaining,
            total: self.total,
        };
        if let Some(cb) = self.on_progress.as_mut() {
            cb(progress);
        }
    }

    fn complete(&mut self, result: Result<TransferSummary>) {
        if let Some(cb) = self.on_complete.take() {
            cb(result);
        }
    }
}

impl Drop for Transfer {
    fn drop(&mut self) {
        self.abort();
    }
}

impl std::fmt::Debug for Transfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transfer")
            .field("phase", &self.phase)
            .field("destination", &self.destination)
            .field("total", &self.total)
            .field("remaining", &self.remaining)
            .finish_non_exhaustive()
    }
}

// ──────────────────────────────────────────────
// Testes
// ──────────────────────────────────────────────
