//! Sockets, servers and the session framework built on the poller.

pub mod buffer_list;
pub mod dns;
pub mod session;
pub mod socket;
pub mod tcp_client;
pub mod tcp_server;
pub mod udp_server;

pub use self::buffer_list::{BufferList, OnSendDone, SendPacket};
pub use self::session::{Session, SessionAllocator, SessionHelper};
pub use self::socket::{SockType, Socket};
pub use self::tcp_client::{ClientHandler, TcpClient};
pub use self::tcp_server::TcpServer;
pub use self::udp_server::{make_sock_id, PeerId, UdpServer};
