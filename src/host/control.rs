//! Built-in `Host` services: handshake and goodbye

use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::host::service::{HandlerSet, Service};
use crate::net::protocol::HandlerRef;

pub const CONTROL_KIND: &str = "Host";

/// Authority -> proxy on accept: `(assigned id, datagram bind token)`
pub const WELCOME: HandlerRef = HandlerRef::new(CONTROL_KIND, "Welcome");
/// Proxy -> authority datagram, plaintext: `(assigned id, bind token)`
pub const BIND_UNRELIABLE: HandlerRef = HandlerRef::new(CONTROL_KIND, "BindUnreliable");
/// Proxy -> authority on orderly stop
pub const CLOSED: HandlerRef = HandlerRef::new(CONTROL_KIND, "Closed");

/// Bind requests sent per welcome; datagrams may be lost
const BIND_ATTEMPTS: usize = 3;

/// Authority side of the control channel
#[derive(Debug, Default)]
pub struct AuthorityControl;

impl Service for AuthorityControl {
    fn kind(&self) -> &'static str {
        CONTROL_KIND
    }

    fn register(self: Arc<Self>, handlers: &mut HandlerSet) {
        handlers.on(CLOSED.method, |ctx, msg| {
            ctx.log()
                .debug(format_args!("{} said goodbye", msg.connection().id()));
            msg.connection().close();
            Ok(())
        });
        // Repeat bind requests arrive once the endpoint is already learned
        handlers.on(BIND_UNRELIABLE.method, |_, _| Ok(()));
    }
}

/// Proxy side of the control channel
#[derive(Debug, Default)]
pub struct ProxyControl {
    assigned: Mutex<Option<Uuid>>,
}

impl ProxyControl {
    /// Identity the authority assigned to this client
    pub fn assigned_id(&self) -> Option<Uuid> {
        *self.assigned.lock()
    }
}

impl Service for ProxyControl {
    fn kind(&self) -> &'static str {
        CONTROL_KIND
    }

    fn register(self: Arc<Self>, handlers: &mut HandlerSet) {
        let this = self.clone();
        handlers.on(WELCOME.method, move |ctx, msg| {
            let id = Uuid::parse_str(msg.arg(0).ok_or_else(|| anyhow::anyhow!("welcome without id"))?)?;
            let token = msg
                .arg(1)
                .ok_or_else(|| anyhow::anyhow!("welcome without bind token"))?;
            *this.assigned.lock() = Some(id);

            let conn = msg.connection();
            let Some(remote) = conn.remote_addr() else {
                return Ok(());
            };
            if !ctx.link().bind_peer(conn, remote) {
                ctx.log().debug("No datagram socket; staying reliable-only");
                return Ok(());
            }
            for _ in 0..BIND_ATTEMPTS {
                ctx.link().request_bind(remote, id, token)?;
            }
            ctx.log().info(format_args!("Welcomed as {}", id));
            Ok(())
        });
    }
}
