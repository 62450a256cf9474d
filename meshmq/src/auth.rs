use async_trait::async_trait;

use crate::conf::Auth;
use crate::types::{ClientId, HashMap, Password, UserName};

/// Credential verification consulted on every CONNECT.
#[async_trait]
pub trait Authenticator: Sync + Send {
    async fn authenticate(&self, username: Option<&UserName>, password: Option<&Password>, client_id: &ClientId)
        -> bool;
}

/// Checks credentials against the `[auth]` section: a static user table plus
/// an anonymous switch for connects that carry no username.
pub struct DefaultAuthenticator {
    allow_anonymous: bool,
    users: HashMap<String, String>,
}

impl DefaultAuthenticator {
    pub fn new(auth: &Auth) -> Self {
        Self {
            allow_anonymous: auth.allow_anonymous,
            users: auth.users.iter().map(|(u, p)| (u.clone(), p.clone())).collect(),
        }
    }
}

#[async_trait]
impl Authenticator for DefaultAuthenticator {
    async fn authenticate(
        &self,
        username: Option<&UserName>,
        password: Option<&Password>,
        client_id: &ClientId,
    ) -> bool {
        let Some(username) = username else {
            if !self.allow_anonymous {
                log::debug!("{} anonymous login refused", client_id);
            }
            return self.allow_anonymous;
        };
        let allowed = match (self.users.get(&**username), password) {
            (Some(expected), Some(password)) => expected.as_bytes() == &password[..],
            _ => false,
        };
        if !allowed {
            log::debug!("{} bad username or password, username: {}", client_id, username);
        }
        allowed
    }
}
