//! Plano de ambiente: fachada única usada pela interface.
//!
//! Junta a sessão de controle, no máximo uma transferência em bloco e a
//! fila de tarefas ociosas (extrações) em um loop de uma thread só. Cada
//! volta do loop ([`EnvironmentPlane::run_once`]):
//!
//! 1. lê até [`MAX_DATAGRAMS_PER_TURN`] datagramas do socket de controle;
//! 2. dá um passo de leitura na transferência ativa e checa o timeout;
//! 3. só se nenhum socket teve trabalho, roda uma tarefa ociosa.
//!
//! [`MAX_DATAGRAMS_PER_TURN`]: crate::session::MAX_DATAGRAMS_PER_TURN

use std::collections::VecDeque;
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::config::{AppConfig, ManagerConfig};
use crate::error::{PlaneError, Result};
use crate::observer::ObserverSink;
use crate::session::{CollectorEndpoint, ControlSession};
use crate::transfer::{CancelToken, CompletionCallback, ProgressCallback, Readiness, Transfer, TransferPhase};
use crate::types::{Program, ProgramId};
use crate::value::ValueCodec;

/// Parâmetros de tempo do loop e das transferências.
#[derive(Debug, Clone, Copy)]
pub struct PlaneOptions {
    pub poll_interval: Duration,
    pub connect_timeout: Duration,
    pub transfer_timeout: Option<Duration>,
}

impl Default for PlaneOptions {
    fn default() -> Self {
        Self::from(&ManagerConfig::default())
    }
}

impl From<&ManagerConfig> for PlaneOptions {
    fn from(config: &ManagerConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            connect_timeout: config.connect_timeout(),
            transfer_timeout: config.transfer_timeout(),
        }
    }
}

struct ActiveTransfer {
    stream: TcpStream,
    transfer: Transfer,
}

/// Gerenciador do plano de ambiente.
pub struct EnvironmentPlane {
    session: ControlSession,
    active: Option<ActiveTransfer>,
    idle: VecDeque<Transfer>,
    options: PlaneOptions,
}

impl EnvironmentPlane {
    pub fn new(bind_addr: impl ToSocketAddrs, sink: Option<Box<dyn ObserverSink>>, options: PlaneOptions) -> Result<Self> {
        Ok(Self {
            session: ControlSession::bind(bind_addr, sink)?,
            active: None,
            idle: VecDeque::new(),
            options,
        })
    }

    pub fn from_config(config: &AppConfig, sink: Option<Box<dyn ObserverSink>>) -> Result<Self> {
        Self::new(config.manager.bind_addr(), sink, PlaneOptions::from(&config.manager))
    }

    /// Substitui o decodificador de valores de probes.
    pub fn with_codec(mut self, codec: Box<dyn ValueCodec>) -> Self {
        self.session.set_codec(codec);
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.session.local_addr()
    }

    pub fn endpoint(&self) -> Option<&CollectorEndpoint> {
        self.session.endpoint()
    }

    pub fn is_collector_functional(&self) -> bool {
        self.session.is_collector_functional()
    }

    /// Todos os programas conhecidos, ordenados por id.
    pub fn programs(&self) -> impl Iterator<Item = &Program> {
        self.session.registry().programs()
    }

    pub fn program(&self, id: ProgramId) -> Result<&Program> {
        self.session.program(id)
    }

    // ──────────────────────────────────────────────
    // Operações da interface
    // ──────────────────────────────────────────────

    pub fn register_on_collector(&mut self, host: &str, control_port: u16, transfer_port: u16) -> Result<bool> {
        self.session.register(host, control_port, transfer_port)
    }

    pub fn unregister_on_collector(&mut self) -> Result<()> {
        self.session.unregister()
    }

    pub fn set_probe_status(&mut self, program: ProgramId, probe_id: u8, enabled: bool, displayed: bool) -> Result<()> {
        self.session.set_probe_status(program, probe_id, enabled, displayed)
    }

    /// Abre a conexão de transferência e agenda a leitura no loop.
    ///
    /// Falhas de configuração e de conexão são retornadas aqui, sem chamar
    /// `on_complete`. Depois disso, `on_complete` é chamada exatamente uma vez.
    pub fn request_transfer(
        &mut self,
        destination: impl Into<PathBuf>,
        on_progress: Option<ProgressCallback>,
        on_complete: Option<CompletionCallback>,
    ) -> Result<CancelToken> {
        if self.active.is_some() || !self.idle.is_empty() {
            return Err(PlaneError::TransferInProgress);
        }

        let endpoint = self.session.endpoint().ok_or(PlaneError::CollectorUnknown)?;
        let addr = endpoint.transfer_addr().ok_or(PlaneError::TransferPortUnknown)?;

        debug!("Iniciando transferência de probes a partir de {addr}");
        let stream = TcpStream::connect_timeout(&addr, self.options.connect_timeout)?;
        stream.set_nonblocking(true)?;

        let mut transfer =
            Transfer::new(destination, on_progress, on_complete)?.with_idle_timeout(self.options.transfer_timeout);
        transfer.connected();
        let token = transfer.cancel_token();

        info!("Transferência conectada a {addr}, destino {}", transfer.destination().display());
        self.active = Some(ActiveTransfer { stream, transfer });
        Ok(token)
    }

    /// Fase da transferência corrente, se houver.
    pub fn transfer_phase(&self) -> Option<TransferPhase> {
        self.active
            .as_ref()
            .map(|a| a.transfer.phase())
            .or_else(|| self.idle.front().map(Transfer::phase))
    }

    // ──────────────────────────────────────────────
    // Loop
    // ──────────────────────────────────────────────

    /// Uma volta do loop. Retorna `true` se algum trabalho foi feito.
    pub fn run_once(&mut self) -> bool {
        let mut busy = self.session.poll() > 0;

        let step = self.active.as_mut().map(|active| {
            let step = active.transfer.on_readable(&mut active.stream);
            if step == Readiness::Idle && active.transfer.check_timeout(Instant::now()) {
                Readiness::Finished
            } else {
                step
            }
        });

        match step {
            Some(Readiness::Progressed) => busy = true,
            Some(Readiness::BodyComplete) => {
                busy = true;
                if let Some(done) = self.active.take() {
                    let _ = done.stream.shutdown(Shutdown::Both);
                    debug!("Corpo recebido, extração agendada");
                    self.idle.push_back(done.transfer);
                }
            }
            Some(Readiness::Finished) => {
                busy = true;
                if let Some(done) = self.active.take() {
                    let _ = done.stream.shutdown(Shutdown::Both);
                }
            }
            Some(Readiness::Idle) | None => {}
        }

        if !busy && let Some(mut transfer) = self.idle.pop_front() {
            if !transfer.poll_cancel() {
                transfer.extract();
            }
            busy = true;
        }

        busy
    }

    /// Roda o loop até `stop` ser acionado, dormindo só quando ocioso.
    pub fn run_until(&mut self, stop: &AtomicBool) {
        while !stop.load(Ordering::Relaxed) {
            if !self.run_once() {
                std::thread::sleep(self.options.poll_interval);
            }
        }
    }

    /// Encerra o plano: aborta transferências, cancela o registro e fecha
    /// os sockets. Equivalente a descartar o valor.
    pub fn cleanup(self) {
        drop(self);
    }
}

impl Drop for EnvironmentPlane {
    fn drop(&mut self) {
        if let Some(mut active) = self.active.take() {
            active.transfer.abort();
            let _ = active.stream.shutdown(Shutdown::Both);
        }
        for mut transfer in self.idle.drain(..) {
            transfer.abort();
        }
        // A sessão cancela o registro no próprio drop
    }
}

// ──────────────────────────────────────────────
// Testes
// ──────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::fixtures::zip_bytes;
    use crate::observer::{ChannelSink, Notification};
    use crate::protocol::{Message, ProbeDescriptor, ProgramDescriptor, ProtocolError, WireReader};
    use crate::types::StorageType;
    use crate::value::ProbeValue;
    use crate::transfer::{TransferProgress, TransferSummary};
    use std::cell::RefCell;
    use std::io::Write;
    use std::net::{TcpListener, UdpSocket};
    use std::rc::Rc;
    use std::thread::JoinHandle;

    type Outcome = Rc<RefCell<Option<Result<TransferSummary>>>>;

    struct Collector {
        udp: UdpSocket,
        tcp: TcpListener,
    }

    impl Collector {
        fn new() -> Self {
            let udp = UdpSocket::bind("127.0.0.1:0").unwrap();
            udp.set_read_timeout(Some(Duration::from_millis(500))).unwrap();
            Self {
                udp,
                tcp: TcpListener::bind("127.0.0.1:0").unwrap(),
            }
        }

        fn control_port(&self) -> u16 {
            self.udp.local_addr().unwrap().port()
        }

        fn transfer_port(&self) -> u16 {
            self.tcp.local_addr().unwrap().port()
        }

        fn recv(&self) -> Message {
            let mut buf = [0u8; 512];
            let (n, _) = self.udp.recv_from(&mut buf).unwrap();
            Message::decode(&buf[..n]).unwrap()
        }

        /// Aceita uma conexão e envia `chunks` em sequência.
        fn serve(self, chunks: Vec<Vec<u8>>) -> JoinHandle<()> {
            std::thread::spawn(move || {
                let (mut conn, _) = self.tcp.accept().unwrap();
                for chunk in chunks {
                    conn.write_all(&chunk).unwrap();
                    conn.flush().unwrap();
                    std::thread::sleep(Duration::from_millis(10));
                }
                // Mantém a conexão aberta até o cliente fechar
                let _ = conn.set_read_timeout(Some(Duration::from_secs(2)));
                let _ = std::io::Read::read(&mut conn, &mut [0u8; 1]);
            })
        }
    }

    fn plane() -> EnvironmentPlane {
        EnvironmentPlane::new("127.0.0.1:0", None, PlaneOptions::default()).unwrap()
    }

    fn completion() -> (Outcome, CompletionCallback) {
        let outcome: Outcome = Rc::default();
        let o = outcome.clone();
        let on_complete: CompletionCallback = Box::new(move |r| *o.borrow_mut() = Some(r));
        (outcome, on_complete)
    }

    fn run_until_done(plane: &mut EnvironmentPlane, outcome: &Outcome) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while outcome.borrow().is_none() && Instant::now() < deadline {
            if !plane.run_once() {
                std::thread::sleep(Duration::from_millis(2));
            }
        }
    }

    #[test]
    fn transfer_extracts_archive_into_destination() {
        let collector = Collector::new();
        let mut plane = plane();
        plane
            .register_on_collector("127.0.0.1", collector.control_port(), collector.transfer_port())
            .unwrap();
        assert_eq!(collector.recv(), Message::Register);

        let archive = zip_bytes(&[("st1/cwnd.log", b"0 1500\n1 3000\n")]);
        let header = (archive.len() as u32).to_be_bytes().to_vec();
        let (first, second) = archive.split_at(archive.len() / 2);
        let server = collector.serve(vec![header, first.to_vec(), second.to_vec()]);

        let dest = tempfile::tempdir().unwrap();
        let (outcome, on_complete) = completion();
        let progress = Rc::new(RefCell::new(Vec::<TransferProgress>::new()));
        let p = progress.clone();
        let on_progress: ProgressCallback = Box::new(move |pr| p.borrow_mut().push(pr));
        plane
            .request_transfer(dest.path(), Some(on_progress), Some(on_complete))
            .unwrap();
        assert_eq!(plane.transfer_phase(), Some(TransferPhase::ReadingHeader));

        run_until_done(&mut plane, &outcome);
        server.join().unwrap();

        let summary = outcome.borrow_mut().take().unwrap().unwrap();
        assert_eq!(summary.bytes, archive.len() as u64);
        assert_eq!(
            std::fs::read_to_string(dest.path().join("st1/cwnd.log")).unwrap(),
            "0 1500\n1 3000\n"
        );
        assert_eq!(plane.transfer_phase(), None);
        assert_eq!(progress.borrow().last().unwrap().received, archive.len() as u64);
    }

    #[test]
    fn transfer_needs_registered_collector_and_port() {
        let collector = Collector::new();
        let mut plane = plane();
        let (outcome, on_complete) = completion();

        let err = plane.request_transfer("unused", None, Some(on_complete)).unwrap_err();
        assert!(matches!(err, PlaneError::CollectorUnknown));

        plane.register_on_collector("127.0.0.1", collector.control_port(), 0).unwrap();
        let err = plane.request_transfer("unused", None, None).unwrap_err();
        assert!(matches!(err, PlaneError::TransferPortUnknown));
        assert!(err.is_config());

        assert!(outcome.borrow().is_none());
    }

    #[test]
    fn refused_connection_is_reported_synchronously() {
        let collector = Collector::new();
        let closed_port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut plane = plane();
        plane
            .register_on_collector("127.0.0.1", collector.control_port(), closed_port)
            .unwrap();

        let (outcome, on_complete) = completion();
        let err = plane.request_transfer("unused", None, Some(on_complete)).unwrap_err();
        assert!(matches!(err, PlaneError::Io(_)));
        assert!(outcome.borrow().is_none());
        assert_eq!(plane.transfer_phase(), None);
    }

    #[test]
    fn only_one_transfer_at_a_time_and_cancel_aborts() {
        let collector = Collector::new();
        let mut plane = plane();
        plane
            .register_on_collector("127.0.0.1", collector.control_port(), collector.transfer_port())
            .unwrap();
        // Só o header: o corpo nunca chega
        let server = collector.serve(vec![1000u32.to_be_bytes().to_vec()]);

        let dest = tempfile::tempdir().unwrap();
        let (outcome, on_complete) = completion();
        let token = plane.request_transfer(dest.path(), None, Some(on_complete)).unwrap();

        assert!(matches!(
            plane.request_transfer(dest.path(), None, None),
            Err(PlaneError::TransferInProgress)
        ));

        let deadline = Instant::now() + Duration::from_secs(2);
        while plane.transfer_phase() != Some(TransferPhase::ReadingBody) && Instant::now() < deadline {
            plane.run_once();
            std::thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(plane.transfer_phase(), Some(TransferPhase::ReadingBody));

        token.cancel();
        run_until_done(&mut plane, &outcome);
        assert!(matches!(outcome.borrow().as_ref().unwrap(), Err(PlaneError::TransferAborted)));
        assert_eq!(plane.transfer_phase(), None);

        drop(plane);
        server.join().unwrap();
    }

    #[test]
    fn cleanup_aborts_active_transfer() {
        let collector = Collector::new();
        let mut plane = plane();
        plane
            .register_on_collector("127.0.0.1", collector.control_port(), collector.transfer_port())
            .unwrap();
        assert_eq!(collector.recv(), Message::Register);
        let server = collector.serve(vec![]);

        let (outcome, on_complete) = completion();
        plane.request_transfer("unused", None, Some(on_complete)).unwrap();

        plane.cleanup();
        assert!(matches!(outcome.borrow().as_ref().unwrap(), Err(PlaneError::TransferAborted)));
        server.join().unwrap();
    }

    #[test]
    fn cleanup_sends_unregister() {
        let collector = Collector::new();
        let mut plane = plane();
        plane.register_on_collector("127.0.0.1", collector.control_port(), 0).unwrap();
        assert_eq!(collector.recv(), Message::Register);

        plane.cleanup();
        assert_eq!(collector.recv(), Message::Unregister);
    }

    /// Valores de 2 bytes, inteiros sem sinal.
    struct ShortCodec;

    impl ValueCodec for ShortCodec {
        fn decode(
            &self,
            _storage: StorageType,
            data: &[u8],
            pos: usize,
        ) -> std::result::Result<(ProbeValue, usize), ProtocolError> {
            let mut r = WireReader::at(data, pos);
            let value = u16::from_be_bytes(r.array("value")?);
            Ok((ProbeValue::Int(value as i32), r.position()))
        }
    }

    #[test]
    fn custom_codec_decodes_probe_samples() {
        let collector = Collector::new();
        let (sink, rx) = ChannelSink::channel(16);
        let mut plane = EnvironmentPlane::new("127.0.0.1:0", Some(Box::new(sink)), PlaneOptions::default())
            .unwrap()
            .with_codec(Box::new(ShortCodec));
        plane.register_on_collector("127.0.0.1", collector.control_port(), 0).unwrap();
        assert_eq!(collector.recv(), Message::Register);

        let me = plane.local_addr().unwrap();
        let id = ProgramId::new(2, 5);
        let program = Message::RegisterProgram(ProgramDescriptor {
            id,
            name: "gw".into(),
            probes: vec![ProbeDescriptor {
                name: "queue".into(),
                unit: "pkt".into(),
                storage: StorageType::new(9),
                enabled: true,
                displayed: true,
            }],
            events: vec![],
        });
        let probes = Message::SendProbes {
            program: id,
            timestamp: 12,
            samples: vec![0, 0x01, 0x2C, 0, 0x00, 0x07],
        };
        collector.udp.send_to(&program.encode().unwrap(), me).unwrap();
        collector.udp.send_to(&probes.encode().unwrap(), me).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        let mut values = Vec::new();
        while values.len() < 2 && Instant::now() < deadline {
            plane.run_once();
            for note in rx.try_iter() {
                if let Notification::ProbeValue(s) = note {
                    values.push((s.timestamp, s.value));
                }
            }
            std::thread::sleep(Duration::from_millis(2));
        }

        assert_eq!(values, vec![(12, ProbeValue::Int(300)), (12, ProbeValue::Int(7))]);
    }

    #[test]
    fn run_until_stops_on_flag() {
        let mut plane = plane();
        let stop = AtomicBool::new(true);
        plane.run_until(&stop);
        assert!(!plane.run_once());
    }
}
