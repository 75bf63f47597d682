//! Maps updates to user handlers.
//!
//! Handlers are registered by bot command, by persisted per-user action
//! and by callback prefix. Registration happens before the router is
//! shared with the dispatcher; afterwards the tables are read-only.

pub mod callback;
pub mod keyboard;
pub mod pagination;

use std::any::{Any, TypeId};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::{Error, ValidationError};
use crate::locale::Locales;
use crate::storage::{ActionStorage, MessageStorage};
use crate::transport::{SendOptions, Transport};
use crate::update::{ChatId, Payload, Update, UserId};

use self::callback::unwrap_callback_data;
use self::pagination::{Pagination, Step, PAGE_BACK, PAGE_NEXT};

/// Command that reaches the current action handler even when its
/// validators would reject the message.
pub const CANCEL_COMMAND: &str = "cancel";

/// A step of a multi-message flow, persisted per user as an integer code.
///
/// Code `0` is reserved for "no active flow" (`storage::NO_ACTION`).
pub trait Action: Copy + Eq + Hash + Send + Sync + 'static {
    fn code(self) -> i64;
    fn from_code(code: i64) -> Option<Self>;
}

impl Action for i64 {
    fn code(self) -> i64 {
        self
    }

    fn from_code(code: i64) -> Option<Self> {
        Some(code)
    }
}

/// Everything a handler learns about the update it is serving.
#[derive(Clone)]
pub struct Context {
    pub chat_id: ChatId,
    pub user_id: Option<UserId>,
    pub update: Arc<Update>,
    /// Culture used for localized replies.
    pub lang: String,
    /// Fires on shutdown; long-running handlers should watch it.
    pub cancel: CancellationToken,
    extensions: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl Context {
    pub fn new(update: Update, default_lang: &str, cancel: CancellationToken) -> Self {
        let lang = update
            .language_code
            .clone()
            .unwrap_or_else(|| default_lang.to_string());
        Self {
            chat_id: update.chat_id,
            user_id: update.user_id,
            update: Arc::new(update),
            lang,
            cancel,
            extensions: HashMap::new(),
        }
    }

    /// Sender of the update; a `State` error when the platform gave none.
    pub fn user(&self) -> Result<UserId, Error> {
        self.user_id.ok_or_else(|| Error::state("user id"))
    }

    /// Attaches a value for downstream handlers, replacing any previous
    /// value of the same type.
    pub fn insert<T: Any + Send + Sync>(&mut self, value: T) {
        self.extensions.insert(TypeId::of::<T>(), Arc::new(value));
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.extensions
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("chat_id", &self.chat_id)
            .field("user_id", &self.user_id)
            .field("update_id", &self.update.id)
            .field("lang", &self.lang)
            .finish_non_exhaustive()
    }
}

pub trait Handler: Send + Sync {
    fn call(&self, ctx: Context) -> BoxFuture<'static, anyhow::Result<()>>;
}

impl<F, Fut> Handler for F
where
    F: Fn(Context) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn call(&self, ctx: Context) -> BoxFuture<'static, anyhow::Result<()>> {
        Box::pin(self(ctx))
    }
}

/// Checks an update before its handler runs. The error carries a
/// localization key for the reply.
pub type Validator = Arc<dyn Fn(&Update) -> Result<(), ValidationError> + Send + Sync>;

pub fn validator<F>(check: F) -> Validator
where
    F: Fn(&Update) -> Result<(), ValidationError> + Send + Sync + 'static,
{
    Arc::new(check)
}

/// Runs before every regular handler. Returning `None` stops processing;
/// the returned context is what downstream handlers see.
pub type Middleware = Arc<dyn Fn(Context) -> BoxFuture<'static, Option<Context>> + Send + Sync>;

#[derive(Clone)]
struct HandlerInfo {
    handler: Arc<dyn Handler>,
    validators: Vec<Validator>,
}

impl HandlerInfo {
    fn new(handler: impl Handler + 'static, validators: Vec<Validator>) -> Self {
        Self {
            handler: Arc::new(handler),
            validators,
        }
    }
}

#[derive(Default)]
struct Hooks {
    chat_member: Option<Arc<dyn Handler>>,
    my_chat_member: Option<Arc<dyn Handler>>,
    rate_limited: Option<Arc<dyn Handler>>,
    migration: Option<Arc<dyn Handler>>,
    middleware: Option<Middleware>,
}

pub struct Router<A: Action> {
    transport: Arc<dyn Transport>,
    actions: Arc<dyn ActionStorage>,
    messages: Arc<dyn MessageStorage>,
    locales: Arc<Locales>,
    commands: HashMap<String, HandlerInfo>,
    action_handlers: HashMap<A, HandlerInfo>,
    callbacks: HashMap<String, HandlerInfo>,
    hooks: Hooks,
    not_flowable: HashSet<A>,
}

impl<A: Action> Router<A> {
    /// Creates a router with the page back/forward callbacks registered.
    pub fn new(
        transport: Arc<dyn Transport>,
        actions: Arc<dyn ActionStorage>,
        messages: Arc<dyn MessageStorage>,
        locales: Arc<Locales>,
    ) -> Self {
        let mut router = Self {
            transport: transport.clone(),
            actions,
            messages: messages.clone(),
            locales,
            commands: HashMap::new(),
            action_handlers: HashMap::new(),
            callbacks: HashMap::new(),
            hooks: Hooks::default(),
            not_flowable: HashSet::new(),
        };

        let pagination = Pagination::new(transport, messages);
        for (prefix, step) in [(PAGE_BACK, Step::Back), (PAGE_NEXT, Step::Next)] {
            let pagination = pagination.clone();
            router.register_callback(
                prefix,
                move |ctx: Context| {
                    let pagination = pagination.clone();
                    async move { pagination.turn(ctx, step).await }
                },
                Vec::new(),
            );
        }
        router
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn locales(&self) -> &Locales {
        &self.locales
    }

    pub fn register_command(
        &mut self,
        name: impl Into<String>,
        handler: impl Handler + 'static,
        validators: Vec<Validator>,
    ) -> &mut Self {
        self.commands
            .insert(name.into(), HandlerInfo::new(handler, validators));
        self
    }

    pub fn register_action(
        &mut self,
        action: A,
        handler: impl Handler + 'static,
        validators: Vec<Validator>,
    ) -> &mut Self {
        self.action_handlers
            .insert(action, HandlerInfo::new(handler, validators));
        self
    }

    /// Registers a handler for callback data of the form `prefix_payload`.
    /// Validators are kept with the handler but callbacks never run them.
    pub fn register_callback(
        &mut self,
        prefix: impl Into<String>,
        handler: impl Handler + 'static,
        validators: Vec<Validator>,
    ) -> &mut Self {
        self.callbacks
            .insert(prefix.into(), HandlerInfo::new(handler, validators));
        self
    }

    /// Validation failures in these actions are answered, but neither the
    /// reply nor the rejected message is remembered for cleanup.
    pub fn add_not_flowable_action(&mut self, action: A) -> &mut Self {
        self.not_flowable.insert(action);
        self
    }

    pub fn on_chat_member(&mut self, handler: impl Handler + 'static) -> &mut Self {
        self.hooks.chat_member = Some(Arc::new(handler));
        self
    }

    pub fn on_my_chat_member(&mut self, handler: impl Handler + 'static) -> &mut Self {
        self.hooks.my_chat_member = Some(Arc::new(handler));
        self
    }

    /// Called from the admission loop for every update dropped by the
    /// inbound rate limiter.
    pub fn on_rate_limited(&mut self, handler: impl Handler + 'static) -> &mut Self {
        self.hooks.rate_limited = Some(Arc::new(handler));
        self
    }

    pub fn on_migration(&mut self, handler: impl Handler + 'static) -> &mut Self {
        self.hooks.migration = Some(Arc::new(handler));
        self
    }

    pub fn with_middleware<F, Fut>(&mut self, middleware: F) -> &mut Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<Context>> + Send + 'static,
    {
        self.hooks.middleware = Some(Arc::new(move |ctx| Box::pin(middleware(ctx))));
        self
    }

    pub fn has_rate_limited_hook(&self) -> bool {
        self.hooks.rate_limited.is_some()
    }

    fn context(&self, update: Update, cancel: CancellationToken) -> Context {
        Context::new(update, self.locales.default_culture(), cancel)
    }

    pub async fn notify_rate_limited(&self, update: Update, cancel: CancellationToken) {
        let Some(hook) = self.hooks.rate_limited.clone() else {
            return;
        };
        run_handler(hook.as_ref(), self.context(update, cancel), "rate limit").await;
    }

    /// Routes one update. Handler failures are logged, never returned.
    pub async fn dispatch(&self, update: Update, cancel: CancellationToken) {
        let ctx = self.context(update, cancel);
        let update_id = ctx.update.id;

        let migrating = ctx
            .update
            .message()
            .is_some_and(|m| m.migrate_to_chat_id.is_some());
        if migrating {
            if let Some(hook) = &self.hooks.migration {
                debug!(update_id, "handle chat migration");
                run_handler(hook.as_ref(), ctx, "chat migration").await;
            }
            return;
        }

        let membership = match &ctx.update.payload {
            Payload::MyChatMember(_) => Some((&self.hooks.my_chat_member, "my chat member")),
            Payload::ChatMember(_) => Some((&self.hooks.chat_member, "chat member")),
            _ => None,
        };
        if let Some((Some(hook), what)) = membership {
            debug!(update_id, what, "handle membership change");
            run_handler(hook.as_ref(), ctx, what).await;
            return;
        }

        let ctx = match &self.hooks.middleware {
            Some(middleware) => match middleware(ctx).await {
                Some(ctx) => ctx,
                None => {
                    debug!(update_id, "middleware rejected update");
                    return;
                }
            },
            None => ctx,
        };

        match &ctx.update.payload {
            Payload::Message(_) => self.handle_message(ctx).await,
            Payload::Callback(_) => self.handle_callback(ctx).await,
            Payload::ChatMember(_) | Payload::MyChatMember(_) => {
                debug!(update_id, "no membership handler registered");
            }
        }
    }

    async fn handle_message(&self, ctx: Context) {
        let update = ctx.update.clone();
        let command = update.command();

        if let Some(info) = command.and_then(|name| self.commands.get(name)) {
            debug!(update_id = update.id, command, "handle command");
            if self.validate(&ctx, &info.validators, None).await {
                run_handler(info.handler.as_ref(), ctx, "command").await;
            }
            return;
        }

        let Some((action, info)) = self.current_action(&ctx).await else {
            return;
        };

        if command == Some(CANCEL_COMMAND) {
            debug!(update_id = update.id, action = action.code(), "cancel current action");
            run_handler(info.handler.as_ref(), ctx, "cancel").await;
            return;
        }

        debug!(update_id = update.id, action = action.code(), "handle action message");
        if self.validate(&ctx, &info.validators, Some(action)).await {
            run_handler(info.handler.as_ref(), ctx, "action").await;
        }
    }

    async fn handle_callback(&self, ctx: Context) {
        let update_id = ctx.update.id;
        let data = ctx.update.callback_data().unwrap_or_default();
        let (prefix, _) = unwrap_callback_data(data);

        if let Some(info) = self.callbacks.get(prefix) {
            debug!(update_id, prefix, "handle callback");
            run_handler(info.handler.as_ref(), ctx, "callback").await;
            return;
        }

        if let Some((action, info)) = self.current_action(&ctx).await {
            debug!(update_id, action = action.code(), "handle action callback");
            run_handler(info.handler.as_ref(), ctx, "action callback").await;
        }
    }

    async fn current_action(&self, ctx: &Context) -> Option<(A, &HandlerInfo)> {
        let update_id = ctx.update.id;
        let user_id = match ctx.user() {
            Ok(user_id) => user_id,
            Err(err) => {
                warn!(update_id, error = %err, "cannot resolve action");
                return None;
            }
        };
        let code = match self.actions.get_action(user_id).await {
            Ok(code) => code,
            Err(err) => {
                error!(update_id, %user_id, error = %err, "failed to load user action");
                return None;
            }
        };
        let found = A::from_code(code)
            .and_then(|action| self.action_handlers.get(&action).map(|info| (action, info)));
        if found.is_none() {
            warn!(update_id, %user_id, action = code, "action handler not found");
        }
        found
    }

    /// Runs validators in order. On the first failure the localized error
    /// is sent to the chat and `false` is returned.
    async fn validate(&self, ctx: &Context, validators: &[Validator], action: Option<A>) -> bool {
        let Some(err) = validators.iter().find_map(|v| v(ctx.update.as_ref()).err()) else {
            return true;
        };
        let chat_id = ctx.chat_id;
        warn!(update_id = ctx.update.id, %chat_id, key = %err.key, "update failed validation");

        let text = self.locales.get(&ctx.lang, &err.key, &[]);
        let reply_id = match self
            .transport
            .send_message(chat_id, &text, SendOptions::default())
            .await
        {
            Ok(id) => id,
            Err(send_err) => {
                error!(%chat_id, error = %send_err, "failed to send validation error");
                return false;
            }
        };

        if action.is_some_and(|a| self.not_flowable.contains(&a)) {
            return false;
        }

        let remembered = [Some(reply_id), ctx.update.message_id()];
        for message_id in remembered.into_iter().flatten() {
            if let Err(save_err) = self
                .messages
                .save_user_message(chat_id, message_id, false)
                .await
            {
                error!(%chat_id, error = %save_err, "failed to save message");
            }
        }
        false
    }
}

async fn run_handler(handler: &dyn Handler, ctx: Context, what: &'static str) {
    let update_id = ctx.update.id;
    let chat_id = ctx.chat_id;
    if let Err(err) = handler.call(ctx).await {
        error!(update_id, %chat_id, handler = what, error = %format!("{err:#}"), "handler failed");
    }
}
