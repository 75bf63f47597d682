use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use botcore::config::Config;
use botcore::error::{Error, ValidationError};
use botcore::locale::Locales;
use botcore::router::callback::{unwrap_callback_data, wrap_callback_data};
use botcore::router::keyboard::build_inline_data_keyboard;
use botcore::router::pagination::send_paged;
use botcore::router::{validator, Action, Context, Router};
use botcore::storage::{
    new_invite_secret, ActionStorage, InMemoryStorage, InviteStorage, MessageStorage,
    SqliteStorage, NO_ACTION,
};
use botcore::transport::{SendOptions, TelegramTransport, Transport};
use botcore::{DispatchSettings, Dispatcher};

const INVITE_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const ITEMS_PER_PAGE: usize = 5;
const ITEM_PREFIX: &str = "item";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Flow {
    Idle,
    AwaitingName,
}

impl Action for Flow {
    fn code(self) -> i64 {
        match self {
            Flow::Idle => NO_ACTION,
            Flow::AwaitingName => 1,
        }
    }

    fn from_code(code: i64) -> Option<Self> {
        match code {
            NO_ACTION => Some(Flow::Idle),
            1 => Some(Flow::AwaitingName),
            _ => None,
        }
    }
}

/// Collaborators shared by the demo handlers
struct App {
    transport: Arc<dyn Transport>,
    actions: Arc<dyn ActionStorage>,
    messages: Arc<dyn MessageStorage>,
    invites: Arc<dyn InviteStorage>,
    locales: Arc<Locales>,
}

impl App {
    async fn reply(&self, ctx: &Context, key: &str, args: &[&str]) -> Result<()> {
        let text = self.locales.get(&ctx.lang, key, args);
        self.transport
            .send_message(ctx.chat_id, &text, SendOptions::default())
            .await?;
        Ok(())
    }
}

async fn start(app: Arc<App>, ctx: Context) -> Result<()> {
    let user_id = ctx.user()?;

    let secret = ctx.update.text().and_then(|t| t.split_whitespace().nth(1));
    if let Some(secret) = secret {
        match app.invites.get_invite(secret).await {
            Ok(inviter) => {
                app.invites.delete_invite(secret).await?;
                app.reply(&ctx, "invited_by", &[&inviter.to_string()]).await?;
            }
            Err(Error::Expired) => app.reply(&ctx, "invite_expired", &[]).await?,
            Err(err) => return Err(err.into()),
        }
    }

    let rollback = app
        .actions
        .save_action_with_rollback(user_id, Flow::AwaitingName.code())
        .await?;
    let asked = app.reply(&ctx, "ask_name", &[]).await;
    rollback.finish(&asked).await?;
    asked
}

async fn remember_name(app: Arc<App>, ctx: Context) -> Result<()> {
    let user_id = ctx.user()?;
    if ctx.update.command() == Some("cancel") {
        app.actions.save_action(user_id, NO_ACTION).await?;
        return app.reply(&ctx, "cancelled", &[]).await;
    }

    let name = ctx.update.text().unwrap_or_default().trim();
    app.reply(&ctx, "nice_to_meet", &[name]).await?;
    app.actions.save_action(user_id, NO_ACTION).await?;
    Ok(())
}

async fn list(app: Arc<App>, ctx: Context) -> Result<()> {
    let keys: Vec<String> = (1..=12).map(|i| format!("Item {i}")).collect();
    let data: HashMap<String, String> = keys
        .iter()
        .enumerate()
        .map(|(i, key)| (key.clone(), wrap_callback_data(ITEM_PREFIX, &(i + 1).to_string())))
        .collect();
    let Some(keyboard) = build_inline_data_keyboard(&keys, &data, ITEMS_PER_PAGE) else {
        return Ok(());
    };

    let text = app.locales.get(&ctx.lang, "pick_item", &[]);
    send_paged(
        app.transport.as_ref(),
        app.messages.as_ref(),
        ctx.chat_id,
        &text,
        &keyboard,
    )
    .await?;
    Ok(())
}

async fn pick(app: Arc<App>, ctx: Context) -> Result<()> {
    let Some(query) = ctx.update.callback() else {
        return Ok(());
    };
    let (_, item) = unwrap_callback_data(query.data.as_deref().unwrap_or_default());
    let text = app.locales.get(&ctx.lang, "picked", &[item]);
    app.transport.answer_callback(&query.id, Some(&text)).await?;
    Ok(())
}

async fn invite(app: Arc<App>, ctx: Context) -> Result<()> {
    let user_id = ctx.user()?;
    let secret = new_invite_secret();
    app.invites.save_invite(&secret, user_id, INVITE_TTL).await?;
    let link = app.transport.invite_link(&secret).await?;
    app.reply(&ctx, "invite_link", &[&link]).await
}

async fn slow_down(app: Arc<App>, ctx: Context) -> Result<()> {
    app.reply(&ctx, "slow_down", &[]).await
}

fn non_empty_text() -> botcore::router::Validator {
    validator(|update| match update.text() {
        Some(text) if !text.trim().is_empty() => Ok(()),
        _ => Err(ValidationError::new("name_empty")),
    })
}

type Storages = (
    Arc<dyn ActionStorage>,
    Arc<dyn MessageStorage>,
    Arc<dyn InviteStorage>,
);

fn shared<S>(storage: S) -> Storages
where
    S: ActionStorage + MessageStorage + InviteStorage + 'static,
{
    let storage = Arc::new(storage);
    (storage.clone(), storage.clone(), storage)
}

fn open_storage(config: &Config) -> Result<Storages> {
    match &config.storage.database_path {
        Some(path) => {
            let storage = SqliteStorage::open(path)
                .with_context(|| format!("Failed to open database {}", path.display()))?;
            info!(path = %path.display(), "using sqlite storage");
            Ok(shared(storage))
        }
        None => {
            info!("using in-memory storage");
            Ok(shared(InMemoryStorage::new()))
        }
    }
}

fn build_router(app: &Arc<App>) -> Router<Flow> {
    let mut router = Router::new(
        app.transport.clone(),
        app.actions.clone(),
        app.messages.clone(),
        app.locales.clone(),
    );

    let a = app.clone();
    router.register_command("start", move |ctx: Context| start(a.clone(), ctx), Vec::new());
    let a = app.clone();
    router.register_command("list", move |ctx: Context| list(a.clone(), ctx), Vec::new());
    let a = app.clone();
    router.register_command("invite", move |ctx: Context| invite(a.clone(), ctx), Vec::new());
    let a = app.clone();
    router.register_action(
        Flow::AwaitingName,
        move |ctx: Context| remember_name(a.clone(), ctx),
        vec![non_empty_text()],
    );
    let a = app.clone();
    router.register_callback(ITEM_PREFIX, move |ctx: Context| pick(a.clone(), ctx), Vec::new());
    let a = app.clone();
    router.on_rate_limited(move |ctx: Context| slow_down(a.clone(), ctx));
    router.on_my_chat_member(|ctx: Context| async move {
        info!(chat_id = %ctx.chat_id, "bot membership changed");
        anyhow::Ok(())
    });
    router.with_middleware(|ctx: Context| async move {
        if ctx.user_id.is_none() {
            warn!(chat_id = %ctx.chat_id, update_id = ctx.update.id, "update without sender ignored");
            return None;
        }
        Some(ctx)
    });
    router
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,botcore=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    info!("Loading configuration from: {}", config_path.display());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    info!("Configuration loaded successfully");
    info!("  Workers: {}", config.dispatch.workers_count);
    info!("  Messages per second: {}", config.dispatch.messages_per_second);
    info!("  Allowed updates: {:?}", config.telegram.allowed_updates);

    let locales = match &config.locale.file_path {
        Some(path) => Locales::load(path)?,
        None => Locales::empty(),
    };

    let (actions, messages, invites) = open_storage(&config)?;
    let transport = Arc::new(
        TelegramTransport::connect(&config)
            .await
            .context("Failed to connect to Telegram")?,
    );

    let cancel = CancellationToken::new();
    let updates = transport.updates(&config.telegram.allowed_updates, cancel.clone());

    let outbound_sweeper = {
        let transport = transport.clone();
        let cancel = cancel.clone();
        let interval = config.dispatch.sweep_interval();
        tokio::spawn(async move { transport.limiter().run_sweeper(interval, cancel).await })
    };

    let app = Arc::new(App {
        transport,
        actions,
        messages,
        invites,
        locales: Arc::new(locales),
    });
    let dispatcher = Dispatcher::new(build_router(&app), DispatchSettings::from(&config.dispatch));

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown requested");
                shutdown.cancel();
            }
            Err(err) => warn!(error = %err, "cannot listen for ctrl-c"),
        }
    });

    info!("Bot is starting...");
    dispatcher.run(updates, cancel.clone()).await;
    cancel.cancel();
    let _ = outbound_sweeper.await;

    Ok(())
}
