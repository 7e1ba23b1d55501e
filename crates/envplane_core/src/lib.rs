//! # Envplane Core
//!
//! Núcleo do gerenciador do plano de ambiente: fala com o coletor por um
//! canal de controle UDP, mantém o registro de programas instrumentados,
//! decodifica valores de probes e baixa os dados de probes por TCP.
//!
//! ## Módulos
//! - [`types`] – Programas, probes e tipos de evento
//! - [`protocol`] – Encode/decode dos datagramas de controle com magic number
//! - [`value`] – Decodificação de valores de probes por tipo de armazenamento
//! - [`registry`] – Registro de programas e despacho de amostras/eventos
//! - [`observer`] – Sink de notificações para a interface
//! - [`session`] – Sessão de controle com o coletor
//! - [`transfer`] – Máquina de estados da transferência em bloco
//! - [`archive`] – Extração do arquivo recebido
//! - [`plane`] – Fachada e loop de eventos
//! - [`config`] – Configuração unificada via TOML
//! - [`error`] – Erros do plano

pub mod archive;
pub mod config;
pub mod error;
pub mod observer;
pub mod plane;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod transfer;
pub mod types;
pub mod value;

// Re-exports convenientes
pub use config::{AppConfig, CollectorConfig, ManagerConfig};
pub use error::{PlaneError, Result};
pub use observer::{ChannelSink, Notification, ObserverSink};
pub use plane::{EnvironmentPlane, PlaneOptions};
pub use protocol::{MAGIC_NUMBER, Message, ProtocolError};
pub use transfer::{CancelToken, TransferPhase, TransferProgress, TransferSummary};
pub use types::{Probe, ProbeState, Program, ProgramId};
pub use value::{ProbeValue, StandardCodec, ValueCodec};
