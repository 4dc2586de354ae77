use time::Date;

/// A push-notification recipient token and the day it was registered.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct UserToken {
    pub token: String,
    pub init_time: Date,
}
