//! Registro de programas anunciados pelo coletor.

use std::collections::BTreeMap;

use tracing::{debug, error};

use crate::error::{PlaneError, Result};
use crate::observer::Notifier;
use crate::types::{Program, ProgramId};
use crate::value::ValueCodec;

/// Programas conhecidos, indexados pelo [`ProgramId`].
#[derive(Debug, Default)]
pub struct ProgramRegistry {
    programs: BTreeMap<ProgramId, Program>,
}

impl ProgramRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.programs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }

    /// Programas ordenados por id.
    pub fn programs(&self) -> impl Iterator<Item = &Program> {
        self.programs.values()
    }

    pub fn lookup(&self, id: ProgramId) -> Result<&Program> {
        self.programs.get(&id).ok_or(PlaneError::UnknownProgram(id))
    }

    pub fn lookup_mut(&mut self, id: ProgramId) -> Result<&mut Program> {
        self.programs.get_mut(&id).ok_or(PlaneError::UnknownProgram(id))
    }

    /// Insere (ou substitui) um programa. Retorna o anterior, se havia.
    pub fn register(&mut self, program: Program, notifier: &mut Notifier) -> Option<Program> {
        let previous = self.programs.insert(program.id(), program);
        notifier.program_list_changed(self);
        previous
    }

    /// Remove um programa. Id desconhecido só gera log.
    pub fn unregister(&mut self, id: ProgramId, notifier: &mut Notifier) -> Option<Program> {
        debug!("Remoção do programa {id}");
        let removed = self.programs.remove(&id);
        if removed.is_none() {
            error!("Programa {id} a remover não encontrado");
        }
        notifier.program_list_changed(self);
        removed
    }

    /// Entrega cada amostra de um `SEND_PROBES` ao sink, na ordem do payload.
    ///
    /// Uma probe desconhecida ou um valor inválido interrompe o restante da
    /// mensagem; as amostras já entregues permanecem. Retorna quantas foram
    /// entregues.
    pub fn dispatch_probes(
        &self,
        id: ProgramId,
        timestamp: u32,
        samples: &[u8],
        codec: &dyn ValueCodec,
        notifier: &mut Notifier,
    ) -> Result<usize> {
        let program = self.lookup(id)?;

        let mut pos = 0;
        let mut delivered = 0;
        while pos < samples.len() {
            let probe_id = samples[pos];
            pos += 1;

            let probe = program.probe(probe_id).ok_or(PlaneError::UnknownProbe {
                program: id,
                probe_id,
            })?;

            let (value, next) = codec.decode(probe.storage(), samples, pos)?;
            pos = next;

            notifier.new_probe_value(program, probe, timestamp, value);
            delivered += 1;
        }

        Ok(delivered)
    }

    /// Entrega um `SEND_EVENT` ao sink.
    ///
    /// Ao contrário de `SEND_PROBES`, um id de evento inválido não descarta
    /// a mensagem: ela segue sem nome nem nível.
    pub fn dispatch_event(&self, id: ProgramId, event_id: u8, message: &[u8], notifier: &mut Notifier) -> Result<()> {
        let program = self.lookup(id)?;

        let event = program.event(event_id);
        if event.is_none() {
            error!("Id de evento {event_id} incorreto recebido do programa {id}");
        }

        let message = String::from_utf8_lossy(message);
        notifier.new_event(program, event_id, event, &message);
        Ok(())
    }
}
