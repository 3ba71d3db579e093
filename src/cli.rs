//! Interface de linha de comando do cliente de CPR baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (login, analyse,
//! create, status, draft) e a flag global `--verbose`.

use clap::{Parser, Subcommand, ValueEnum};

use crate::api::WorkflowKind;

/// cpr — cliente do backend de análise e criação de CPR.
#[derive(Debug, Parser)]
#[command(name = "cpr", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Sobrescreve a URL do backend configurada.
    #[arg(long, global = true)]
    pub api_url: Option<String>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

/// Workflow aceito pela CLI.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum KindArg {
    /// Análise de uma CPR existente.
    Analise,
    /// Criação de uma nova CPR.
    Criar,
}

impl From<KindArg> for WorkflowKind {
    fn from(arg: KindArg) -> Self {
        match arg {
            KindArg::Analise => WorkflowKind::Analyse,
            KindArg::Criar => WorkflowKind::Create,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Autentica e guarda o par de tokens.
    Login {
        #[arg(long)]
        username: String,

        /// Senha; lida de `CPR_PASSWORD` se omitida.
        #[arg(long, env = "CPR_PASSWORD", hide_env_values = true)]
        password: String,
    },

    /// Remove as credenciais guardadas.
    Logout,

    /// Conversa com o workflow de análise de CPR.
    Analyse {
        /// Retoma uma sessão existente.
        #[arg(long)]
        session: Option<String>,
    },

    /// Conversa com o workflow de criação de CPR.
    Create {
        /// Retoma uma sessão existente.
        #[arg(long)]
        session: Option<String>,
    },

    /// Consulta uma vez o status de uma sessão.
    Status {
        #[arg(value_enum)]
        kind: KindArg,
        session_id: String,
    },

    /// Operações sobre rascunhos.
    Draft {
        #[command(subcommand)]
        action: DraftAction,
    },
}

#[derive(Debug, Subcommand)]
pub enum DraftAction {
    /// Cria um rascunho, opcionalmente com campos iniciais em JSON.
    New {
        #[arg(long)]
        fields: Option<String>,
    },
    /// Mostra um rascunho.
    Show { id: String },
    /// Atualiza parcialmente um rascunho com um objeto JSON.
    Patch { id: String, fields: String },
    /// Submete o rascunho (terminal).
    Submit {
        id: String,
        #[arg(long)]
        fields: Option<String>,
    },
}
