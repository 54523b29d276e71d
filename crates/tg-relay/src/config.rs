use crate::{llm, relay, tg};
use serde::de::DeserializeOwned;

pub struct Config {
    pub(crate) tg: tg::Config,
    pub(crate) tg_client: tg::ClientConfig,
    pub(crate) llm: llm::Config,
    pub(crate) relay: relay::Config,
}

impl Config {
    pub fn load_or_panic() -> Config {
        Self {
            tg: from_env_or_panic("TG_BOT_"),
            tg_client: from_env_or_panic("TG_CLIENT_"),
            llm: from_env_or_panic("LLM_"),
            relay: from_env_or_panic("RELAY_"),
        }
    }
}

pub(crate) fn from_env_or_panic<T: DeserializeOwned>(prefix: &str) -> T {
    envy::prefixed(prefix).from_env().unwrap_or_else(|err| {
        panic!(
            "BUG: Couldn't load config from environment for {}: {:#?}",
            std::any::type_name::<T>(),
            err
        );
    })
}
