//! Interface de terminal da CLI — spinners e saída colorida.
//!
//! Usa as crates `indicatif` para spinners de progresso e `console` para
//! estilização com cores. O [`SessionProgress`] acompanha visualmente
//! uma sessão de workflow no terminal.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::workflow::{SessionSnapshot, SessionState};

/// Indicador visual de uma sessão de workflow no terminal.
///
/// Mensagens do agente em ciano, sucesso em verde, falha em vermelho.
pub struct SessionProgress {
    pb: Option<ProgressBar>,
    cyan: Style,
    green: Style,
    red: Style,
    dim: Style,
}

impl Default for SessionProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionProgress {
    pub fn new() -> Self {
        Self {
            pb: None,
            cyan: Style::new().cyan(),
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            dim: Style::new().dim(),
        }
    }

    /// Inicia o spinner enquanto o servidor trabalha.
    pub fn working(&mut self, message: &str) {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
            pb.set_style(style);
        }
        pb.set_message(message.to_string());
        pb.enable_steady_tick(std::time::Duration::from_millis(100));
        self.pb = Some(pb);
    }

    /// Atualiza o spinner com a etapa atual.
    pub fn update(&self, snap: &SessionSnapshot) {
        if let Some(pb) = &self.pb {
            let step = snap.current_step.as_deref().unwrap_or("...");
            pb.set_message(format!("{}: {step}", snap.state));
        }
    }

    pub fn stop(&mut self) {
        if let Some(pb) = self.pb.take() {
            pb.finish_and_clear();
        }
    }

    /// Imprime a mensagem mais recente do agente.
    pub fn agent_says(&self, snap: &SessionSnapshot) {
        if !snap.text.trim().is_empty() {
            println!("{} {}", self.cyan.apply_to("agente>"), snap.text);
        }
        if let Some(step) = &snap.current_step {
            println!("{}", self.dim.apply_to(format!("  [{}] {step}", snap.state)));
        }
    }

    /// Resultado final da sessão, com o payload formatado em JSON.
    pub fn finish(&mut self, snap: &SessionSnapshot) {
        self.stop();
        match snap.state {
            SessionState::Completed => {
                println!("  {} Workflow concluído", self.green.apply_to("✓"));
                if let Some(url) = &snap.payload.document_url {
                    println!("  Documento: {url}");
                }
            }
            SessionState::Failed => {
                let reason = snap.last_error.as_deref().unwrap_or("erro desconhecido");
                println!("  {} Workflow falhou: {reason}", self.red.apply_to("✗"));
            }
            _ => {}
        }
        if !snap.payload.is_empty() {
            println!(
                "{}",
                serde_json::to_string_pretty(&snap.payload).unwrap_or_default()
            );
        }
    }

    pub fn error(&mut self, message: &str) {
        self.stop();
        eprintln!("  {} {message}", self.red.apply_to("✗"));
    }
}
