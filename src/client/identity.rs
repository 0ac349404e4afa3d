use log::info;
use tokio::sync::watch;

use crate::common::Participant;

/// Source of the signed-in user, with a push notification on every auth change.
pub trait IdentityProvider: Send + Sync {
    fn current_user(&self) -> Option<Participant>;

    fn auth_changes(&self) -> watch::Receiver<Option<Participant>>;
}

/// Identity held in memory for the lifetime of a client session.
#[derive(Debug)]
pub struct SessionIdentity {
    tx: watch::Sender<Option<Participant>>,
}

impl Default for SessionIdentity {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionIdentity {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    pub fn signed_in(user: Participant) -> Self {
        let (tx, _) = watch::channel(Some(user));
        Self { tx }
    }

    pub fn sign_in(&self, user: Participant) {
        info!("[AUTH] signed in as {}", user.id);
        self.tx.send_replace(Some(user));
    }

    pub fn sign_out(&self) {
        if let Some(previous) = self.tx.send_replace(None) {
            info!("[AUTH] {} signed out", previous.id);
        }
    }
}

impl IdentityProvider for SessionIdentity {
    fn current_user(&self) -> Option<Participant> {
        self.tx.borrow().clone()
    }

    fn auth_changes(&self) -> watch::Receiver<Option<Participant>> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sign_in_and_out_are_pushed() {
        let identity = SessionIdentity::new();
        let mut changes = identity.auth_changes();
        assert_eq!(identity.current_user(), None);

        identity.sign_in(Participant::new("u1"));
        changes.changed().await.unwrap();
        assert_eq!(changes.borrow().as_ref().map(|p| p.id.as_str()), Some("u1"));

        identity.sign_out();
        changes.changed().await.unwrap();
        assert!(changes.borrow().is_none());
        assert_eq!(identity.current_user(), None);
    }
}
