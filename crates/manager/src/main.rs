//! # Envplane Manager
//!
//! Registra-se no coletor, acompanha programas, probes e eventos em tempo
//! real e, opcionalmente, baixa os dados de probes gravados.
//!
//! ## Uso
//! ```bash
//! envplane_manager                          # Acompanha o coletor do config.toml
//! envplane_manager --config outro.toml      # Config alternativo
//! envplane_manager --transfer [DIR]         # Baixa os dados de probes e sai
//! ```

mod plane_thread;

use envplane_core::config::AppConfig;
use envplane_core::observer::Notification;
use plane_thread::{PlaneCommand, spawn_plane_thread};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{debug, error, info, warn};

/// Argumentos de linha de comando.
#[derive(Debug, Default)]
struct Args {
    config: Option<PathBuf>,
    /// `Some(None)` = transferir para o diretório do config
    transfer: Option<Option<PathBuf>>,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Args, String> {
    let mut parsed = Args::default();
    let mut iter = args.into_iter().peekable();

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => {
                let path = iter.next().ok_or("--config exige um caminho")?;
                parsed.config = Some(PathBuf::from(path));
            }
            "--transfer" => {
                let dir = iter.next_if(|a| !a.starts_with("--")).map(PathBuf::from);
                parsed.transfer = Some(dir);
            }
            other => return Err(format!("Argumento desconhecido: {other}")),
        }
    }

    Ok(parsed)
}

fn main() -> ExitCode {
    // ── Logging ──
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = match parse_args(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    // ── Carregar config ──
    let config_path = args.config.clone().unwrap_or_else(AppConfig::default_path);
    let config = AppConfig::load(&config_path);

    // Salva config padrão se não existir
    if !config_path.exists()
        && let Err(e) = config.save(&config_path)
    {
        warn!("Não foi possível salvar config padrão: {e}");
    }

    let errors = config.validate();
    if !errors.is_empty() {
        for e in &errors {
            error!("Config inválida: {e}");
        }
        return ExitCode::FAILURE;
    }

    let transfer_dir = args
        .transfer
        .map(|dir| dir.unwrap_or_else(|| PathBuf::from(&config.manager.destination_dir)));

    // ── Thread do plano ──
    let handle = match spawn_plane_thread(config) {
        Ok(handle) => handle,
        Err(e) => {
            error!("Falha ao criar thread do plano: {e}");
            return ExitCode::FAILURE;
        }
    };

    let mut status = ExitCode::SUCCESS;
    let mut transfer_requested = false;

    for notification in handle.notifications.iter() {
        match notification {
            Notification::CollectorStatus(true) => {
                info!("Coletor funcional");
                if let (Some(dir), false) = (&transfer_dir, transfer_requested) {
                    transfer_requested = true;
                    let _ = handle.commands.send(PlaneCommand::Transfer(dir.clone()));
                }
            }
            Notification::CollectorStatus(false) => warn!("Coletor não está mais funcional"),
            Notification::ProgramList(programs) => {
                info!("{} programa(s) registrado(s)", programs.len());
                for p in &programs {
                    info!("  {} {} ({} probes, {} eventos)", p.id, p.name, p.probes, p.events);
                }
            }
            Notification::ProbeValue(s) => {
                debug!("{} t={} {} = {} {}", s.program, s.timestamp, s.probe_name, s.value, s.unit);
            }
            Notification::Event(ev) => {
                let name = ev.name.as_deref().unwrap_or("?");
                let level = ev.level.map(|l| l.to_string()).unwrap_or_default();
                info!("{} {} {name} {level}: {}", ev.program, ev.program_name, ev.message);
            }
            Notification::TransferProgress(p) => {
                debug!("Transferência: {}/{} bytes", p.received, p.total);
            }
            Notification::TransferFinished(result) => {
                match result {
                    Ok(summary) => info!(
                        "Dados de probes em {} ({} bytes, {} entradas)",
                        summary.destination.display(),
                        summary.bytes,
                        summary.entries
                    ),
                    Err(e) => {
                        error!("Transferência falhou: {e}");
                        status = ExitCode::FAILURE;
                    }
                }
                if transfer_dir.is_some() {
                    let _ = handle.commands.send(PlaneCommand::Shutdown);
                }
            }
        }
    }

    // O channel fecha quando a thread termina
    if handle.thread.join().is_err() {
        error!("Thread do plano terminou com pânico");
        return ExitCode::FAILURE;
    }
    status
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Result<Args, String> {
        parse_args(list.iter().map(|s| s.to_string()))
    }

    #[test]
    fn no_arguments_only_watches() {
        let parsed = args(&[]).unwrap();
        assert!(parsed.config.is_none());
        assert!(parsed.transfer.is_none());
    }

    #[test]
    fn transfer_with_and_without_directory() {
        assert_eq!(args(&["--transfer"]).unwrap().transfer, Some(None));
        assert_eq!(
            args(&["--transfer", "out"]).unwrap().transfer,
            Some(Some(PathBuf::from("out")))
        );
        let parsed = args(&["--transfer", "--config", "c.toml"]).unwrap();
        assert_eq!(parsed.transfer, Some(None));
        assert_eq!(parsed.config, Some(PathBuf::from("c.toml")));
    }

    #[test]
    fn bad_arguments_are_rejected() {
        assert!(args(&["--config"]).is_err());
        assert!(args(&["--verbose"]).is_err());
    }
}
