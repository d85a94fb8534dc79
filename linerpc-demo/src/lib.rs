use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use linerpc::{DispatchRegistry, Error, Remote, Result};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: u64,
    pub name: String,
}

/// In-memory user store published as `saveUser` and `saveUsers`.
#[derive(Default)]
pub struct UserRemote {
    users: Mutex<BTreeMap<u64, User>>,
}

impl UserRemote {
    pub const SAVE_USER: &str = "saveUser";
    pub const SAVE_USERS: &str = "saveUsers";

    pub fn save(&self, users: &[User]) {
        let mut map = match self.users.lock() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        for user in users {
            map.insert(user.id, user.clone());
        }
    }

    #[must_use]
    pub fn get(&self, id: u64) -> Option<User> {
        match self.users.lock() {
            Ok(map) => map.get(&id).cloned(),
            Err(poisoned) => poisoned.into_inner().get(&id).cloned(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self.users.lock() {
            Ok(map) => map.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Remote for UserRemote {
    fn export(self: Arc<Self>, registry: &mut DispatchRegistry) -> Result<()> {
        registry.register_method(&self, Self::SAVE_USER, |this, user: User| async move {
            this.save(std::slice::from_ref(&user));
            Ok::<_, Error>(user)
        })?;
        registry.register_method(&self, Self::SAVE_USERS, |this, users: Vec<User>| async move {
            this.save(&users);
            Ok::<_, Error>(users)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use linerpc::{ServerDispatcher, ServerRequest, code};
    use serde_json::json;

    #[tokio::test]
    async fn test_user_remote() {
        let remote = Arc::new(UserRemote::default());
        let mut registry = DispatchRegistry::default();
        registry.export(remote.clone()).unwrap();
        assert_eq!(registry.len(), 2);
        assert!(registry.export(remote.clone()).is_err());

        let dispatcher = ServerDispatcher::new(registry);
        let rsp = dispatcher
            .process(ServerRequest {
                id: 1,
                command: "saveUser".into(),
                content: json!({"id": 1, "name": "John doe"}),
            })
            .await;
        assert_eq!(rsp.code, code::SUCCESS);
        assert_eq!(rsp.result, json!({"id": 1, "name": "John doe"}));

        let rsp = dispatcher
            .process(ServerRequest {
                id: 2,
                command: "saveUsers".into(),
                content: json!([{"id": 2, "name": "a"}, {"id": 3, "name": "b"}]),
            })
            .await;
        assert_eq!(rsp.code, code::SUCCESS);
        assert_eq!(remote.len(), 3);
        assert_eq!(remote.get(3).map(|u| u.name), Some("b".to_string()));
    }
}
