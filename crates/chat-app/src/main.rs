mod error;
mod history;
mod repl;
mod settings;

use std::process::ExitCode;
use std::sync::Arc;

use tern_llm::{OptionsResolver, RigTransport, SessionContext};
use tern_session::ChatSession;
use tern_storage::SessionId;
use tokio::io::BufReader;
use tracing_subscriber::EnvFilter;

use crate::error::AppResult;
use crate::history::open_history_store;
use crate::repl::{Console, Repl, TranscriptPrinter};
use crate::settings::SettingsStore;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(error = %error, "tern exited with an error");
            eprintln!("tern: {error}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> AppResult<()> {
    let settings_store = Arc::new(SettingsStore::load());
    let session_id = match settings_store.ensure_session_id() {
        Ok(session_id) => session_id,
        Err(error) => {
            tracing::warn!(error = %error, "could not save session id; history will not carry over");
            SessionId::new_v7()
        }
    };

    let settings = settings_store.settings();
    let history = open_history_store(&settings).await?;

    let mut session = ChatSession::new(
        session_id,
        Arc::new(RigTransport::new()),
        settings_store.clone(),
        history,
    )
    .with_history_window(settings.history_window);
    if let Some(preamble) = settings.preamble.clone() {
        session = session.with_preamble(preamble);
    }
    let session = Arc::new(session);

    let console = Console::stdout();
    session.subscribe(Arc::new(TranscriptPrinter::new(console.clone())));

    if let Err(error) = session.restore().await {
        tracing::warn!(session_id = %session_id, error = %error, "failed to restore history");
        console.line(&format!("(could not restore history: {error})"));
    }

    let options = settings_store.resolve(&SessionContext::new(session_id.to_string()));
    console.line(&format!(
        "tern {session_id} · {} · /clear /history /reload /quit, ctrl-c cancels",
        options.model
    ));

    Repl::new(session, console)
        .with_settings(settings_store)
        .run(BufReader::new(tokio::io::stdin()))
        .await
}
