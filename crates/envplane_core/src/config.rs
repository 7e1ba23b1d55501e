//! Configuração unificada via TOML.
//!
//! Um único `config.toml` ao lado do executável, com uma seção para o
//! coletor e outra para o manager.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Coletor no qual o manager se registra.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Host ou IP do coletor
    pub host: String,
    /// Porta UDP do canal de controle
    pub control_port: u16,
    /// Porta TCP da transferência em bloco (0 = desconhecida)
    pub transfer_port: u16,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            control_port: 5358,
            transfer_port: 5359,
        }
    }
}

/// Parâmetros locais do manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// IP local para bind (vazio = todas as interfaces)
    pub bind_ip: String,
    /// Porta UDP local (0 = escolhida pelo sistema)
    pub bind_port: u16,
    /// Pausa do loop quando nenhum socket tem dados (ms)
    pub poll_interval_ms: u64,
    /// Timeout para abrir a conexão de transferência (segundos)
    pub connect_timeout_secs: f64,
    /// Tempo máximo sem bytes durante a transferência (segundos, 0 = sem limite)
    pub transfer_timeout_secs: f64,
    /// Diretório padrão onde os dados de probes são extraídos
    pub destination_dir: String,
    /// Capacidade do channel de notificações
    pub notification_buffer: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            bind_ip: String::new(),
            bind_port: 0,
            poll_interval_ms: 20,
            connect_timeout_secs: 5.0,
            transfer_timeout_secs: 30.0,
            destination_dir: "probe_data".into(),
            notification_buffer: 256,
        }
    }
}

impl ManagerConfig {
    /// Endereço de bind do socket de controle.
    pub fn bind_addr(&self) -> String {
        let ip = if self.bind_ip.is_empty() { "0.0.0.0" } else { &self.bind_ip };
        format!("{ip}:{}", self.bind_port)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.connect_timeout_secs).unwrap_or(Duration::from_secs(5))
    }

    pub fn transfer_timeout(&self) -> Option<Duration> {
        Duration::try_from_secs_f64(self.transfer_timeout_secs)
            .ok()
            .filter(|t| !t.is_zero())
    }
}

/// Configuração raiz do aplicativo.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub collector: CollectorConfig,
    pub manager: ManagerConfig,
}

impl AppConfig {
    /// Carrega configuração de um arquivo TOML.
    pub fn load(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(content) => match toml::from_str::<AppConfig>(&content) {
                    Ok(config) => {
                        info!("Configuração carregada de {}", path.display());
                        return config;
                    }
                    Err(e) => {
                        warn!("Erro ao parsear {}: {}", path.display(), e);
                    }
                },
                Err(e) => {
                    warn!("Erro ao ler {}: {}", path.display(), e);
                }
            }
        }

        info!("Usando configuração padrão");
        AppConfig::default()
    }

    /// Salva configuração em arquivo TOML.
    pub fn save(&self, path: &Path) -> Result<(), String> {
        let content = toml::to_string_pretty(self).map_err(|e| e.to_string())?;
        std::fs::write(path, content).map_err(|e| e.to_string())?;
        info!("Configuração salva em {}", path.display());
        Ok(())
    }

    /// Retorna o caminho padrão do config.toml.
    pub fn default_path() -> PathBuf {
        let exe_dir = std::env::current_exe()
            .map(|p| p.parent().unwrap_or(Path::new(".")).to_path_buf())
            .unwrap_or_else(|_| PathBuf::from("."));
        exe_dir.join("config.toml")
    }

    /// Valida a configuração e retorna lista de erros.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.collector.host.trim().is_empty() {
            errors.push("Host do coletor não pode ser vazio".into());
        }
        if self.collector.control_port == 0 {
            errors.push("Porta de controle do coletor não pode ser 0".into());
        }
        if self.manager.poll_interval_ms == 0 || self.manager.poll_interval_ms > 1000 {
            errors.push(format!(
                "Intervalo de polling inválido: {} ms (1–1000)",
                self.manager.poll_interval_ms
            ));
        }
        if self.manager.connect_timeout_secs.is_nan() || self.manager.connect_timeout_secs <= 0.0 {
            errors.push(format!(
                "Timeout de conexão inválido: {}",
                self.manager.connect_timeout_secs
            ));
        }
        if self.manager.transfer_timeout_secs < 0.0 {
            errors.push(format!(
                "Timeout de transferência inválido: {}",
                self.manager.transfer_timeout_secs
            ));
        }
        if self.manager.notification_buffer == 0 {
            errors.push("Buffer de notificações não pode ser 0".into());
        }

        errors
    }
}
