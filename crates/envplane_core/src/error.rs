//! Erros do plano de ambiente.

use std::net::SocketAddr;

use crate::protocol::ProtocolError;
use crate::types::ProgramId;

/// Erros retornados pelas operações do plano.
#[derive(Debug, thiserror::Error)]
pub enum PlaneError {
    #[error("Mensagem inválida: {0}")]
    Malformed(#[from] ProtocolError),

    #[error("Dados recebidos de host desconhecido {0}")]
    UnknownPeer(SocketAddr),

    #[error("Programa {0} não encontrado")]
    UnknownProgram(ProgramId),

    #[error("Probe {probe_id} desconhecida no programa {program}")]
    UnknownProbe { program: ProgramId, probe_id: u8 },

    #[error("Coletor desconhecido: registre-se antes")]
    CollectorUnknown,

    #[error("Porta de transferência do coletor desconhecida")]
    TransferPortUnknown,

    #[error("Não foi possível resolver o endereço do coletor '{0}'")]
    UnresolvedHost(String),

    #[error("Já existe uma transferência em andamento")]
    TransferInProgress,

    #[error("Transferência cancelada")]
    TransferAborted,

    #[error("Transferência sem atividade há mais de {0:?}")]
    TransferTimeout(std::time::Duration),

    #[error("Conexão encerrada com {remaining} bytes ainda esperados")]
    TransferTruncated { remaining: u64 },

    #[error("Erro no arquivo de probes: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("Erro de I/O: {0}")]
    Io(#[from] std::io::Error),
}

impl PlaneError {
    /// Erros de configuração são reportados ao chamador e nunca repetidos.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            PlaneError::CollectorUnknown | PlaneError::TransferPortUnknown | PlaneError::UnresolvedHost(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, PlaneError>;
