pub mod api;

use crate::cli::Args;
use self::api::BotKeys;
use std::error::Error;

pub struct Server {
    addr: String,
    keys: BotKeys,
    args: Args,
}

impl Server {
    pub fn new(addr: String, keys: BotKeys, args: Args) -> Self {
        Self { addr, keys, args }
    }

    pub async fn run(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        api::start_http_server(&self.addr, self.keys.clone(), self.args.clone()).await
    }
}
