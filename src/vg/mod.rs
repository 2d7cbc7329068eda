pub mod asyncutil;
pub mod build_info;
pub mod channel;
pub mod cli;
pub mod config;
pub mod control;
pub mod daemon;
pub mod event;
pub mod facts;
pub mod probe;
pub mod rpc;
pub mod service;
pub mod state;
pub mod tls;
pub mod transport;
pub mod validator;

pub fn main() -> anyhow::Result<()> {
    cli::run()
}
