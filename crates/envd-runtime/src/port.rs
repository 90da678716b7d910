use std::net::TcpListener;

/// Ask the OS for a currently free TCP port.
///
/// The listener is dropped before returning, so another process may grab the
/// port before the container binds it. The runtime reports that case as
/// "port is already allocated".
pub fn get_free_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind(("0.0.0.0", 0))?;
    Ok(listener.local_addr()?.port())
}
