//! Sessão do canal de controle (UDP) com o coletor.
//!
//! A sessão é dona do socket, do registro de programas e do sink. Ela só
//! aceita datagramas do coletor registrado; qualquer falha de decodificação
//! descarta apenas aquele datagrama.

use std::io::ErrorKind;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};

use tracing::{debug, error, info, warn};

use crate::error::{PlaneError, Result};
use crate::observer::{Notifier, ObserverSink};
use crate::protocol::{MAX_DATAGRAM, Message};
use crate::registry::ProgramRegistry;
use crate::types::{Program, ProgramId};
use crate::value::{StandardCodec, ValueCodec};

/// Coletor com o qual a sessão está registrada.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectorEndpoint {
    pub control: SocketAddr,
    pub transfer_port: u16,
}

impl CollectorEndpoint {
    /// Endereço TCP da transferência em bloco, se a porta é conhecida.
    pub fn transfer_addr(&self) -> Option<SocketAddr> {
        (self.transfer_port != 0).then(|| SocketAddr::new(self.control.ip(), self.transfer_port))
    }
}

/// Estado do registro no coletor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Registered(CollectorEndpoint),
    Unregistered,
}

/// Limite de datagramas lidos por volta do loop.
pub const MAX_DATAGRAMS_PER_TURN: usize = 64;

/// Sessão de controle.
pub struct ControlSession {
    socket: UdpSocket,
    state: SessionState,
    collector_functional: bool,
    registry: ProgramRegistry,
    codec: Box<dyn ValueCodec>,
    notifier: Notifier,
    buf: Vec<u8>,
}

impl ControlSession {
    /// Abre o socket UDP (não bloqueante) em `bind_addr`.
    pub fn bind(bind_addr: impl ToSocketAddrs, sink: Option<Box<dyn ObserverSink>>) -> Result<Self> {
        let socket = UdpSocket::bind(bind_addr)?;
        socket.set_nonblocking(true)?;
        debug!("Socket de controle em {}", socket.local_addr()?);

        Ok(Self {
            socket,
            state: SessionState::Idle,
            collector_functional: false,
            registry: ProgramRegistry::new(),
            codec: Box::new(StandardCodec),
            notifier: Notifier::new(sink),
            buf: vec![0; MAX_DATAGRAM],
        })
    }

    /// Substitui o decodificador de valores de probes.
    pub fn set_codec(&mut self, codec: Box<dyn ValueCodec>) {
        self.codec = codec;
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn endpoint(&self) -> Option<&CollectorEndpoint> {
        match &self.state {
            SessionState::Registered(endpoint) => Some(endpoint),
            _ => None,
        }
    }

    pub fn is_collector_functional(&self) -> bool {
        self.collector_functional
    }

    pub fn registry(&self) -> &ProgramRegistry {
        &self.registry
    }

    pub fn program(&self, id: ProgramId) -> Result<&Program> {
        self.registry.lookup(id)
    }

    // ──────────────────────────────────────────────
    // Registro no coletor
    // ──────────────────────────────────────────────

    /// Registra a sessão no coletor `host:control_port`.
    ///
    /// Se já existe um coletor registrado, o novo é ignorado e o primeiro
    /// continua valendo; retorna `false` nesse caso.
    pub fn register(&mut self, host: &str, control_port: u16, transfer_port: u16) -> Result<bool> {
        if let SessionState::Registered(current) = self.state {
            info!(
                "Coletor duplicado em {host}:{control_port}, ignorando (ativo: {})",
                current.control
            );
            return Ok(false);
        }

        let control = resolve(host, control_port)?;
        let endpoint = CollectorEndpoint { control, transfer_port };
        self.state = SessionState::Registered(endpoint);

        info!("Registrando no coletor {control}");
        self.send(&Message::Register)?;
        Ok(true)
    }

    /// Cancela o registro. Sem coletor registrado, não faz nada.
    pub fn unregister(&mut self) -> Result<()> {
        let SessionState::Registered(endpoint) = self.state else {
            return Ok(());
        };

        info!("Cancelando registro no coletor {}", endpoint.control);
        // O endpoint é liberado mesmo que o envio falhe
        let sent = self.send(&Message::Unregister);
        self.state = SessionState::Unregistered;
        self.set_collector_functional(false);
        sent
    }

    fn set_collector_functional(&mut self, functional: bool) {
        if self.collector_functional != functional {
            self.collector_functional = functional;
            self.notifier.collector_status_changed(functional);
        }
    }

    /// Atualiza as flags de uma probe e avisa o coletor.
    ///
    /// Exige um coletor registrado; caso contrário falha sem alterar nada.
    pub fn set_probe_status(&mut self, program: ProgramId, probe_id: u8, enabled: bool, displayed: bool) -> Result<()> {
        if self.endpoint().is_none() {
            return Err(PlaneError::CollectorUnknown);
        }

        let probe = self
            .registry
            .lookup_mut(program)?
            .probe_mut(probe_id)
            .ok_or(PlaneError::UnknownProbe { program, probe_id })?;
        probe.set_status(enabled, displayed);
        let state = probe.state();

        debug!(
            "Atualizando probe {probe_id} do programa {program}: enabled = {}, displayed = {}",
            probe.is_enabled(),
            probe.is_displayed()
        );

        self.send(&Message::SetProbeStatus {
            program,
            probe_id,
            state,
        })
    }

    fn send(&self, message: &Message) -> Result<()> {
        let endpoint = self.endpoint().ok_or(PlaneError::CollectorUnknown)?;
        let frame = message.encode()?;
        self.socket.send_to(&frame, endpoint.control)?;
        Ok(())
    }

    // ──────────────────────────────────────────────
    // Recepção
    // ──────────────────────────────────────────────

    /// Lê os datagramas disponíveis sem bloquear, no máximo
    /// [`MAX_DATAGRAMS_PER_TURN`]; o resto fica para a próxima volta.
    /// Retorna quantos foram lidos (válidos ou não).
    pub fn poll(&mut self) -> usize {
        let mut received = 0;
        while received < MAX_DATAGRAMS_PER_TURN {
            match self.socket.recv_from(&mut self.buf) {
                Ok((size, from)) => {
                    received += 1;
                    let packet = self.buf[..size].to_vec();
                    if let Err(e) = self.handle_datagram(&packet, from) {
                        error!("{e}");
                    }
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    // ICMP "port unreachable" do coletor aparece aqui em alguns sistemas
                    warn!("Erro ao receber UDP: {e}");
                    break;
                }
            }
        }
        received
    }

    /// Valida e aplica um datagrama recebido de `from`.
    pub fn handle_datagram(&mut self, packet: &[u8], from: SocketAddr) -> Result<()> {
        if self.endpoint().map(|e| e.control) != Some(from) {
            return Err(PlaneError::UnknownPeer(from));
        }

        let message = Message::decode(packet)?;
        self.apply(message)
    }

    fn apply(&mut self, message: Message) -> Result<()> {
        match message {
            Message::RegisterAck => {
                info!("Coletor confirmou o registro");
                self.set_collector_functional(true);
            }
            Message::RegisterProgram(desc) => {
                debug!(
                    "Registro de {} {} probes={:?} events={:?}",
                    desc.id,
                    desc.name,
                    desc.probes.iter().map(|p| p.name.as_str()).collect::<Vec<_>>(),
                    desc.events.iter().map(|e| e.ident.as_str()).collect::<Vec<_>>()
                );
                let program = Program::from_descriptor(&desc);
                self.registry.register(program, &mut self.notifier);
            }
            Message::UnregisterProgram(id) => {
                self.registry.unregister(id, &mut self.notifier);
            }
            Message::SendProbes {
                program,
                timestamp,
                samples,
            } => {
                self.registry
                    .dispatch_probes(program, timestamp, &samples, self.codec.as_ref(), &mut self.notifier)?;
            }
            Message::SendEvent {
                program,
                event_id,
                message,
            } => {
                self.registry.dispatch_event(program, event_id, &message, &mut self.notifier)?;
            }
            Message::Register | Message::Unregister | Message::SetProbeStatus { .. } => {
                warn!("Comando {:?} não esperado vindo do coletor", message.command());
            }
        }
        Ok(())
    }
}

impl Drop for ControlSession {
    // Falhas no envio do UNREGISTER não impedem a liberação do socket
    fn drop(&mut self) {
        if let Err(e) = self.unregister() {
            warn!("Falha ao cancelar registro no coletor: {e}");
        }
        debug!("Socket de controle fechado");
    }
}

/// Resolve `host:port` preferindo IPv4, como o coletor.
pub(crate) fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|_| PlaneError::UnresolvedHost(host.to_string()))?
        .collect();
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| PlaneError::UnresolvedHost(host.to_string()))
}

// ──────────────────────────────────────────────
// Testes
// ──────────────────────────────────────────────
