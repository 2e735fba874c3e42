//! Account repository: the user's privacy rules, one rule list per
//! privacy key.

use std::sync::Arc;

use estafette_shared::{PrivacyKey, PrivacyRule};

use crate::error::Result;
use crate::keys;
use crate::store::StoreInner;

const PREFIX_PRIVACY: &str = "PRIVACY";

pub struct Account {
    inner: Arc<StoreInner>,
}

fn privacy_key_name(key: PrivacyKey) -> &'static str {
    match key {
        PrivacyKey::LastSeen => "last_seen",
        PrivacyKey::ProfilePhoto => "profile_photo",
        PrivacyKey::ForwardedMessage => "forwarded_message",
        PrivacyKey::Call => "call",
        PrivacyKey::ChatInvite => "chat_invite",
    }
}

fn privacy_store_key(key: PrivacyKey) -> Vec<u8> {
    let mut k = keys::tag(PREFIX_PRIVACY);
    keys::push_str(&mut k, privacy_key_name(key));
    k
}

impl Account {
    pub(crate) fn new(inner: Arc<StoreInner>) -> Self {
        Self { inner }
    }

    pub fn set_privacy(&self, key: PrivacyKey, rules: &[PrivacyRule]) -> Result<()> {
        self.inner.engine.update(|txn| {
            txn.put(privacy_store_key(key), bincode::serialize(rules)?)?;
            Ok(())
        })
    }

    /// Rules for a privacy key; never configured reads as no rules.
    pub fn privacy(&self, key: PrivacyKey) -> Result<Vec<PrivacyRule>> {
        self.inner.engine.view(|txn| {
            match txn.get(privacy_store_key(key))? {
                Some(val) => Ok(bincode::deserialize(&val)?),
                None => Ok(Vec::new()),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Store, StoreOptions};

    #[test]
    fn privacy_rules_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_at(dir.path(), StoreOptions::default()).unwrap();
        let account = store.account();

        // Unset keys read as no rules.
        assert!(account.privacy(PrivacyKey::Call).unwrap().is_empty());

        let rules = vec![
            PrivacyRule::AllowContacts,
            PrivacyRule::DenyUsers(vec![3, 7]),
        ];
        account.set_privacy(PrivacyKey::LastSeen, &rules).unwrap();
        assert_eq!(account.privacy(PrivacyKey::LastSeen).unwrap(), rules);

        // Keys are independent.
        assert!(account.privacy(PrivacyKey::ChatInvite).unwrap().is_empty());
    }
}
