//! Single-threaded, readiness-based networking core following the reactor
//! pattern. A [`Reactor`] multiplexes listeners and connected sockets (plus a
//! waker and a level-triggered timer wheel) over a single poll(2) loop owned
//! by the caller. [`SocketManager`] and [`ListenerManager`] translate raw
//! readiness into socket I/O, and [`NetworkSystem`] unifies everything behind
//! a flat [`NetworkEvent`] list consumed imperatively by applications.
//!
//! On top of the core sit two protocol engines — an incremental HTTP/1.1
//! codec with server/client glue ([`http`]) and an RFC 6455 WebSocket framer
//! with handshake upgrade ([`ws`]) — and a cooperative task sequencer
//! ([`Sequence`]) driven by timer expiry flags.
//!
//! All application callbacks run on the reactor thread; the only operation
//! permitted from other threads is [`Waker::wake`].

#[macro_use]
extern crate amplify;

pub mod buffer;
pub mod clock;
pub mod http;
mod listener;
mod managers;
pub mod poller;
mod reactor;
mod sequence;
mod socket;
mod system;
mod timers;
pub mod ws;

pub use buffer::{Buffer, BufferPool, PoolStats};
pub use clock::Timestamp;
pub use listener::Listener;
pub use managers::{ConnectionResult, ListenerManager, SocketManager, SocketResult};
pub use poller::{IoType, PollSet, PollerEvent, Revents};
pub use reactor::{PollableId, PollableKind, Reactor, Waker};
pub use sequence::Sequence;
pub use socket::Socket;
pub use system::{Error, NetworkEvent, NetworkSystem};
pub use timers::{TimerId, TimerWheel};
