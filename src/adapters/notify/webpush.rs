//! Web Push bridge. Converts new-message events into push deliveries.
//!
//! VAPID signing and payload encryption are the push library's concern; this
//! module owns key loading, subscriber matching, payload shaping and the
//! pruning of dead subscriptions. Key generation is external: `full` mode
//! without keys downgrades to disabled with a warning.

use crate::adapters::persistence::keys;
use crate::domain::DomainError;
use crate::ports::StorePort;
use crate::shared::{AppConfig, PushMode};
use serde_json::json;
use std::sync::Arc;
use web_push::{
    ContentEncoding, HyperWebPushClient, SubscriptionInfo, URL_SAFE_NO_PAD,
    VapidSignatureBuilder, WebPushClient, WebPushError, WebPushMessageBuilder,
};
use tracing::{debug, info, warn};

pub struct PushManager {
    store: Arc<dyn StorePort>,
    client: HyperWebPushClient,
    private_key: String,
    public_key: String,
    contact: Option<String>,
}

impl PushManager {
    /// Load keys (environment first, metadata second) and build the manager.
    /// Returns `None` when push is off, basic, or `full` without usable keys.
    pub async fn initialize(
        cfg: &AppConfig,
        store: Arc<dyn StorePort>,
    ) -> Result<Option<PushManager>, DomainError> {
        match cfg.push_mode {
            PushMode::Off => {
                info!("push notifications disabled");
                return Ok(None);
            }
            PushMode::Basic => {
                info!("basic in-browser notifications only; no server push");
                return Ok(None);
            }
            PushMode::Full => {}
        }

        let (private_key, public_key) = match (&cfg.vapid_private_key, &cfg.vapid_public_key) {
            (Some(private), Some(public)) => {
                info!("using VAPID keys from environment");
                (private.clone(), public.clone())
            }
            _ => {
                let stored_private = store.get_metadata(keys::VAPID_PRIVATE_KEY).await?;
                let stored_public = store.get_metadata(keys::VAPID_PUBLIC_KEY).await?;
                match (stored_private, stored_public) {
                    (Some(private), Some(public)) => {
                        info!("loaded VAPID keys from metadata");
                        (private, public)
                    }
                    _ => {
                        warn!(
                            "PUSH_NOTIFICATIONS=full but no VAPID keys available; \
                             provide VAPID_PRIVATE_KEY/VAPID_PUBLIC_KEY (push disabled)"
                        );
                        return Ok(None);
                    }
                }
            }
        };

        info!(
            public_key_prefix = &public_key[..public_key.len().min(20)],
            "web push initialized"
        );
        Ok(Some(PushManager {
            store,
            client: HyperWebPushClient::new(),
            private_key,
            public_key,
            contact: cfg.vapid_contact.clone(),
        }))
    }

    /// Public key the browser uses to subscribe.
    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    /// Deliver a new-message notification to every subscription matching the
    /// chat (or subscribed globally). Returns the number delivered.
    pub async fn notify_new_message(
        &self,
        chat_id: i64,
        chat_title: &str,
        sender_name: Option<&str>,
        message_text: &str,
        message_id: i64,
    ) -> usize {
        let preview: String = message_text.chars().take(100).collect();
        let body = match sender_name {
            Some(sender) if !sender.is_empty() => format!("{sender}: {preview}"),
            _ => preview,
        };
        let payload = json!({
            "title": chat_title,
            "body": body,
            "icon": "/static/favicon.ico",
            "tag": format!("chat-{chat_id}"),
            "data": {
                "type": "new_message",
                "chat_id": chat_id,
                "message_id": message_id,
                "url": format!("/?chat={chat_id}&msg={message_id}"),
            },
        })
        .to_string();

        let subscriptions = match self.store.get_push_subscriptions(Some(chat_id)).await {
            Ok(subs) => subs,
            Err(e) => {
                warn!(error = %e, "could not load push subscriptions");
                return 0;
            }
        };
        if subscriptions.is_empty() {
            return 0;
        }

        let mut sent = 0;
        let mut gone = Vec::new();
        for sub in &subscriptions {
            let info = SubscriptionInfo::new(&sub.endpoint, &sub.p256dh, &sub.auth);
            match self.send_one(&info, payload.as_bytes()).await {
                Ok(()) => sent += 1,
                Err(
                    WebPushError::EndpointNotFound
                    | WebPushError::EndpointNotValid
                    | WebPushError::Unauthorized,
                ) => {
                    debug!(endpoint = %truncated(&sub.endpoint), "push subscription gone, pruning");
                    gone.push(sub.endpoint.clone());
                }
                Err(e) => warn!(error = %e, "push delivery failed"),
            }
        }
        for endpoint in gone {
            if let Err(e) = self.store.delete_push_subscription(&endpoint).await {
                warn!(error = %e, "failed to prune push subscription");
            }
        }
        if sent > 0 {
            info!(chat_id, sent, "push notifications delivered");
        }
        sent
    }

    async fn send_one(
        &self,
        subscription: &SubscriptionInfo,
        payload: &[u8],
    ) -> Result<(), WebPushError> {
        let mut signature =
            VapidSignatureBuilder::from_base64(&self.private_key, URL_SAFE_NO_PAD, subscription)?;
        if let Some(contact) = &self.contact {
            signature.add_claim("sub", contact.as_str());
        }
        let signature = signature.build()?;

        let mut message = WebPushMessageBuilder::new(subscription);
        message.set_payload(ContentEncoding::Aes128Gcm, payload);
        message.set_vapid_signature(signature);
        self.client.send(message.build()?).await
    }
}

fn truncated(endpoint: &str) -> &str {
    &endpoint[..endpoint.len().min(50)]
}
