//! The thirteen-state per-connection state machine, expressed as a pure
//! transition function so it is unit-testable independently of any socket
//! I/O.

use crate::framer::ResponseKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyState {
    Disconnected,
    ClientConnected,
    AgentConnecting,
    Ready,
    BufferingCommand,
    BufferingInquire,
    DataReady,
    SendingToAgent,
    WaitingForAgent,
    SendingToClient,
    Error,
    Closing,
    Fatal,
}

/// Events that drive a transition. The proxy's connection driver attaches
/// the actual bytes when it raises an event; this module only cares about
/// the shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    ClientAccepted,
    StartConnect,
    GreetingReceived,
    ConnectFailed,
    ClientBytes,
    CommandFramed,
    InquireFramed,
    FramerError,
    Dispatch,
    WriteOk,
    WriteErr,
    AgentResponse,
    AgentTimeout,
    AgentSocketErr,
    ClientBytesDuringWait,
    Classify(ResponseKind),
    CleanupStart,
    CleanupOk,
    CleanupErr,
}

/// Apply one event to `state`, returning the next state. An event not
/// listed for the current state is a protocol violation and transitions
/// to `Error`, except from `Fatal` (terminal, never transitions) and from
/// `Closing`/`Error` themselves
/// where only their own listed events apply.
pub fn transition(state: ProxyState, event: &Event) -> ProxyState {
    use Event::*;
    use ProxyState::*;

    match (state, event) {
        (Disconnected, ClientAccepted) => ClientConnected,

        (ClientConnected, StartConnect) => AgentConnecting,

        (AgentConnecting, GreetingReceived) => Ready,
        (AgentConnecting, ConnectFailed) => Error,

        (Ready, ClientBytes) => BufferingCommand,

        (BufferingCommand, ClientBytes) => BufferingCommand,
        (BufferingCommand, CommandFramed) => DataReady,
        (BufferingCommand, FramerError) => Error,

        (BufferingInquire, ClientBytes) => BufferingInquire,
        (BufferingInquire, InquireFramed) => DataReady,
        (BufferingInquire, FramerError) => Error,

        (DataReady, Dispatch) => SendingToAgent,

        (SendingToAgent, WriteOk) => WaitingForAgent,
        (SendingToAgent, WriteErr) => Error,

        (WaitingForAgent, AgentResponse) => SendingToClient,
        (WaitingForAgent, AgentTimeout) => Error,
        (WaitingForAgent, AgentSocketErr) => Error,
        (WaitingForAgent, ClientBytesDuringWait) => Error,

        (SendingToClient, Classify(ResponseKind::Ok)) => Ready,
        (SendingToClient, Classify(ResponseKind::Err)) => Ready,
        (SendingToClient, Classify(ResponseKind::Inquire)) => BufferingInquire,
        (SendingToClient, WriteErr) => Error,

        (Error, CleanupStart) => Closing,

        (Closing, CleanupOk) => Disconnected,
        (Closing, CleanupErr) => Fatal,

        (Fatal, _) => Fatal,

        // Any other (state, event) pair is a protocol violation.
        _ => Error,
    }
}
