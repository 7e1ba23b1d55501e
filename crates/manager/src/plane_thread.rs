//! Thread do plano de ambiente: roda o loop de eventos, recebe comandos e
//! envia notificações para a thread principal via channel.

use crossbeam_channel::{Receiver, Sender, TryRecvError, bounded};
use envplane_core::config::AppConfig;
use envplane_core::observer::{ChannelSink, Notification};
use envplane_core::plane::EnvironmentPlane;
use envplane_core::transfer::{CancelToken, CompletionCallback, ProgressCallback};
use std::path::PathBuf;
use std::thread::JoinHandle;
use tracing::{error, info, warn};

/// Comando enviado da thread principal para o plano.
#[derive(Debug, Clone)]
pub enum PlaneCommand {
    /// Baixa os dados de probes para o diretório dado.
    Transfer(PathBuf),
    Shutdown,
}

/// Pontas da thread do plano.
pub struct PlaneHandle {
    pub commands: Sender<PlaneCommand>,
    pub notifications: Receiver<Notification>,
    pub thread: JoinHandle<()>,
}

/// Inicia a thread do plano e registra no coletor configurado.
pub fn spawn_plane_thread(config: AppConfig) -> std::io::Result<PlaneHandle> {
    let (cmd_tx, cmd_rx) = bounded::<PlaneCommand>(16); // Buffer de 16 comandos
    let (sink, notifications) = ChannelSink::channel(config.manager.notification_buffer);

    let thread = std::thread::Builder::new()
        .name("envplane".into())
        .spawn(move || plane_loop(&config, sink, &cmd_rx))?;

    Ok(PlaneHandle {
        commands: cmd_tx,
        notifications,
        thread,
    })
}

fn plane_loop(config: &AppConfig, sink: ChannelSink, commands: &Receiver<PlaneCommand>) {
    let mut plane = match EnvironmentPlane::from_config(config, Some(Box::new(sink.clone()))) {
        Ok(plane) => plane,
        Err(e) => {
            error!("Falha ao abrir socket de controle em {}: {e}", config.manager.bind_addr());
            return;
        }
    };

    let collector = &config.collector;
    if let Err(e) = plane.register_on_collector(&collector.host, collector.control_port, collector.transfer_port) {
        error!("Falha ao registrar no coletor {}:{}: {e}", collector.host, collector.control_port);
        return;
    }
    if let Ok(addr) = plane.local_addr() {
        info!("Plano de ambiente escutando em {addr}");
    }

    let poll_interval = config.manager.poll_interval();

    loop {
        // ── Comandos ──
        loop {
            let command = match commands.try_recv() {
                Ok(command) => command,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => PlaneCommand::Shutdown,
            };

            match command {
                PlaneCommand::Transfer(dir) => {
                    if let Err(e) = start_transfer(&mut plane, &sink, dir) {
                        warn!("Transferência não iniciada: {e}");
                        sink.send(Notification::TransferFinished(Err(e.to_string())));
                    }
                }
                PlaneCommand::Shutdown => {
                    info!("Encerrando plano de ambiente");
                    plane.cleanup();
                    return;
                }
            }
        }

        // ── Sockets e tarefas ociosas ──
        if !plane.run_once() {
            std::thread::sleep(poll_interval);
        }
    }
}

fn start_transfer(
    plane: &mut EnvironmentPlane,
    sink: &ChannelSink,
    dir: PathBuf,
) -> envplane_core::Result<CancelToken> {
    let progress_sink = sink.clone();
    let done_sink = sink.clone();

    let on_progress: ProgressCallback = Box::new(move |progress| {
        progress_sink.send(Notification::TransferProgress(progress));
    });
    let on_complete: CompletionCallback = Box::new(move |result| {
        done_sink.send(Notification::TransferFinished(result.map_err(|e| e.to_string())));
    });

    plane.request_transfer(dir, Some(on_progress), Some(on_complete))
}
