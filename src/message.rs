use tokio::sync::mpsc::Sender;

use crate::config::StartParams;
use crate::counters::CountersSnapshot;
use crate::error::IsochError;

#[derive(Debug, Clone)]
pub enum Action {
    Quit,
    StartDuplex(Box<StartParams>),
    StopDuplex { guid: u64 },
    Counters,
}

#[derive(Debug, Clone)]
pub enum Reply {
    Started { guid: u64 },
    Stopped { guid: u64 },
    Counters(Box<CountersSnapshot>),
    Quitting,
}

#[derive(Debug, Clone)]
pub enum Message {
    Request(Action),
    Response(Result<Reply, IsochError>),
    Channel(Sender<Message>),
}
