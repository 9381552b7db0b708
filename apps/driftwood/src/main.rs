use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use url::Url;

use driftwood_client_core::api::ApiClient;
use driftwood_client_core::auth::{MemoryTokenStore, ParticipationTokenManager};
use driftwood_client_core::config::Config;
use driftwood_client_core::controller::DiscussionSyncController;
use driftwood_client_core::interactions::{InteractionStateCache, ReqwestInteractionBackend};
use driftwood_client_core::model::IdentityState;

#[derive(Parser, Debug)]
#[command(name = "driftwood", about = "Tail a live discussion from the terminal")]
struct Cli {
    /// Discussion to open
    discussion_id: String,

    /// Server address (env: DRIFTWOOD_SERVER)
    #[arg(long, env = "DRIFTWOOD_SERVER")]
    server: Option<String>,

    /// API key for anonymous participation (env: DRIFTWOOD_API_KEY)
    #[arg(long, env = "DRIFTWOOD_API_KEY")]
    api_key: Option<String>,

    /// Submit one idea and exit
    #[arg(long)]
    submit: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("driftwood=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match cli.server {
        Some(server) => Config::new(server)?,
        None => Config::from_env()?,
    }
    .with_api_key(cli.api_key);
    let base_url: Url = config.base_url().clone();

    let api = Arc::new(ApiClient::new(config).context("building api client")?);
    let tokens = Arc::new(ParticipationTokenManager::new(
        Arc::new(MemoryTokenStore::new()),
        api.clone(),
    ));
    let interactions = Arc::new(InteractionStateCache::new(
        base_url,
        Arc::new(ReqwestInteractionBackend::new().context("building interaction backend")?),
    ));

    let controller = DiscussionSyncController::open(
        api,
        tokens,
        interactions,
        cli.discussion_id.clone(),
        IdentityState::Unauthenticated,
    )
    .await
    .context("opening discussion")?;

    if let Some(text) = cli.submit {
        let ack = controller.submit_idea(&text).await?;
        println!("submitted: {}", ack.idea_id.unwrap_or_else(|| "<pending>".into()));
        controller.close();
        return Ok(());
    }

    let mut state = controller.state();
    {
        let view = state.borrow().clone();
        if let Some(discussion) = &view.discussion {
            println!("{} ({} ideas)", discussion.title, discussion.idea_count);
        }
        print_topics(&view.topics);
    }

    loop {
        tokio::select! {
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = state.borrow().clone();
                println!(
                    "[{:?}] {} topics, {} drifting",
                    view.channel_status,
                    view.topics.len(),
                    view.unclustered_count
                );
                print_topics(&view.topics);
                if let Some(warning) = view.warnings.last() {
                    eprintln!("warning: {warning}");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                break;
            }
        }
    }

    controller.close();
    Ok(())
}

fn print_topics(topics: &[std::sync::Arc<driftwood_client_core::model::Topic>]) {
    for topic in topics {
        println!("  {:>4}  {}", topic.count, topic.representative_text);
    }
}
