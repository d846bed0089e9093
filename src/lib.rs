//! An overlay transport for a mesh of nodes. A [Router](router::Router) per node owns the links
//!  to its direct neighbours and discovers multi-hop routes to all other nodes. Applications
//!  talk to a peer through [DatagramStream](stream::datagram_stream::DatagramStream)s, which
//!  are multiplexed over the router and offer four combinations of reliability and ordering.

pub mod callback;
pub mod config;
pub mod link;
pub mod messaging;
pub mod router;
pub mod slice;
pub mod status;
pub mod stream;
pub mod test_util;
pub mod timer;
pub mod util;


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::DEBUG)
            // .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
