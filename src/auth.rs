use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

/// One shared password for every login. The user name only selects the
/// actor (`staff` or `parent_<ULID>`), see `booking::Actor`.
#[derive(Debug)]
pub struct DaybookAuthSource {
    password: String,
}

impl DaybookAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for DaybookAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        tracing::debug!("login as {:?}", login.user());
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
