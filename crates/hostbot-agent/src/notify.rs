use tokio::sync::mpsc;

/// A message produced outside a request/reply cycle (crash alerts, shipped
/// logs, owner diagnostics).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub chat_id: i64,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<Notice>,
}

impl Outbox {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Notice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, chat_id: i64, text: impl Into<String>) {
        let notice = Notice {
            chat_id,
            text: text.into(),
        };
        if self.tx.send(notice).is_err() {
            tracing::debug!(chat_id, "outbox closed; notice dropped");
        }
    }

    /// Sends once per distinct chat.
    pub fn send_many(&self, chats: &[i64], text: &str) {
        let mut seen = Vec::with_capacity(chats.len());
        for &chat in chats {
            if seen.contains(&chat) {
                continue;
            }
            seen.push(chat);
            self.send(chat, text);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_many_dedups_chats() {
        let (outbox, mut rx) = Outbox::channel();
        outbox.send_many(&[1, 2, 1], "hi");
        drop(outbox);

        let mut got = Vec::new();
        while let Some(n) = rx.recv().await {
            got.push(n.chat_id);
        }
        assert_eq!(got, vec![1, 2]);
    }
}
