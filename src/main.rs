use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cpr_client::api::{AuthenticatedClient, RequestOptions, WorkflowKind};
use cpr_client::auth::{FileTokenStore, TokenStore};
use cpr_client::cli::{Cli, Command, DraftAction};
use cpr_client::config::CprConfig;
use cpr_client::draft::DraftRepository;
use cpr_client::orchestrator::WorkflowOrchestrator;
use cpr_client::ui::SessionProgress;
use cpr_client::workflow::{WorkflowPoller, fetch_status};
use cpr_client::CprError;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "cpr_client=debug,cpr=debug"
    } else {
        "cpr_client=info,cpr=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut config = CprConfig::load()?;
    if let Some(url) = cli.api_url {
        config.api_url = url;
    }
    let store: Arc<dyn TokenStore> = Arc::new(
        FileTokenStore::open(&config.token_path)
            .with_context(|| format!("opening {}", config.token_path.display()))?,
    );
    let client = AuthenticatedClient::new(config.client_config(), store)?;

    match cli.command {
        Command::Login { username, password } => {
            client.login(&username, &password).await?;
            println!("Login realizado.");
        }
        Command::Logout => {
            client.logout()?;
            println!("Credenciais removidas.");
        }
        Command::Analyse { session } => {
            let orch = WorkflowOrchestrator::new(client, WorkflowPoller::new(config.poller_config()));
            converse(&orch, WorkflowKind::Analyse, session).await?;
        }
        Command::Create { session } => {
            let orch = WorkflowOrchestrator::new(client, WorkflowPoller::new(config.poller_config()));
            converse(&orch, WorkflowKind::Create, session).await?;
        }
        Command::Status { kind, session_id } => {
            let resp = fetch_status(&client, kind.into(), &session_id, &RequestOptions::default()).await?;
            println!("{}", serde_json::to_string_pretty(&resp)?);
        }
        Command::Draft { action } => run_draft(DraftRepository::new(client), action).await?,
    }

    Ok(())
}

/// Interactive loop: prints agent messages, reads user input from stdin.
async fn converse(orch: &WorkflowOrchestrator, kind: WorkflowKind, existing: Option<String>) -> Result<()> {
    if !orch.client().is_authenticated() {
        bail!("não autenticado; rode `cpr login` primeiro");
    }

    let mut progress = SessionProgress::new();
    progress.working("iniciando sessão");
    let (session, mut snap) = match orch.begin(kind, existing.as_deref()).await {
        Ok(started) => started,
        Err(e) => {
            progress.error(&e.to_string());
            return Err(e.into());
        }
    };
    progress.stop();
    if let Some(id) = &snap.session_id {
        println!("sessão {id} (retome com --session {id})");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut updates = session.subscribe();
    loop {
        progress.agent_says(&snap);
        if snap.state.is_terminal() {
            progress.finish(&snap);
            break;
        }

        print!("você> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/sair" {
            break;
        }

        progress.working("enviando");
        let send = orch.send(&session, line, None);
        tokio::pin!(send);
        let result = loop {
            tokio::select! {
                result = &mut send => break result,
                Ok(()) = updates.changed() => progress.update(&updates.borrow_and_update()),
            }
        };
        progress.stop();

        match result {
            Ok(next) => snap = next,
            Err(e) if e.is_auth_expired() => {
                progress.error(&e.to_string());
                if let Some(id) = &session.snapshot().session_id {
                    println!("rode `cpr login` e retome com --session {id}");
                }
                break;
            }
            Err(e @ (CprError::PollTimeout { .. } | CprError::WorkflowFailed(_))) => {
                progress.error(&e.to_string());
                break;
            }
            Err(e) => {
                // Recoverable: the session is still waiting for input.
                progress.error(&e.to_string());
                snap = session.snapshot();
            }
        }
    }

    session.abandon();
    Ok(())
}

async fn run_draft(repo: DraftRepository, action: DraftAction) -> Result<()> {
    match action {
        DraftAction::New { fields } => {
            let fields = fields.as_deref().map(parse_fields).transpose()?;
            let draft = repo.create(fields).await?;
            println!("{}", serde_json::to_string_pretty(&draft)?);
        }
        DraftAction::Show { id } => {
            let draft = repo.get(&id).await?;
            println!("{}", serde_json::to_string_pretty(&draft)?);
        }
        DraftAction::Patch { id, fields } => {
            let draft = repo.patch(&id, parse_fields(&fields)?).await?;
            println!("{}", serde_json::to_string_pretty(&draft)?);
        }
        DraftAction::Submit { id, fields } => {
            let fields = fields.as_deref().map(parse_fields).transpose()?.unwrap_or_default();
            let result = repo.submit(&id, fields).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
    }
    Ok(())
}

fn parse_fields(raw: &str) -> Result<Map<String, Value>> {
    match serde_json::from_str::<Value>(raw).context("fields must be JSON")? {
        Value::Object(map) => Ok(map),
        _ => bail!("fields must be a JSON object"),
    }
}
