mod requester;

use easy_ext::ext;
use teloxide::types::{Chat, User};

pub(crate) mod prelude {
    pub(crate) use super::requester::UtilRequesterExt as _;
    pub(crate) use super::{ChatExt as _, UserExt as _};
}

#[ext(UserExt)]
pub(crate) impl User {
    /// `@username (id)` or `Full Name (id)` for users without a username
    fn debug_id(&self) -> String {
        match &self.username {
            Some(username) => format!("@{username} ({})", self.id),
            None => format!("{} ({})", self.full_name(), self.id),
        }
    }
}

#[ext(ChatExt)]
pub(crate) impl Chat {
    fn debug_id(&self) -> String {
        let name = self
            .title()
            .map(ToOwned::to_owned)
            .or_else(|| self.username().map(|username| format!("@{username}")))
            .unwrap_or_else(|| "private chat".to_owned());

        format!("{name} ({})", self.id)
    }
}
