use shared::domain::{Conversation, ConversationId, Message};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToastLevel {
    Info,
    Success,
    Warning,
    Error,
}

/// User-facing notification sink. Calls are fire-and-forget.
pub trait Notifier: Send + Sync {
    fn toast(&self, level: ToastLevel, text: &str);
    fn new_message(&self, conversation: Option<&Conversation>, message: &Message);
    fn new_conversation(&self, conversation: &Conversation);
    fn error(&self, text: &str);
    fn typing(&self, _conversation_id: &ConversationId, _typing_users: usize) {}
}

/// Default sink: writes every notification to the tracing pipeline.
#[derive(Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn toast(&self, level: ToastLevel, text: &str) {
        match level {
            ToastLevel::Info | ToastLevel::Success => info!(?level, "notify: {text}"),
            ToastLevel::Warning => warn!("notify: {text}"),
            ToastLevel::Error => error!("notify: {text}"),
        }
    }

    fn new_message(&self, conversation: Option<&Conversation>, message: &Message) {
        let customer = conversation.map(|conversation| conversation.customer.name.as_str());
        info!(
            conversation_id = %message.conversation_id,
            customer,
            "notify: new message"
        );
    }

    fn new_conversation(&self, conversation: &Conversation) {
        info!(
            conversation_id = %conversation.id,
            customer = conversation.customer.name.as_str(),
            "notify: new conversation"
        );
    }

    fn error(&self, text: &str) {
        error!("notify: {text}");
    }
}
