//! Echo interpreter peer. Started by a controller with `SHELLMUX_CONNECT` set.

use shellmux::echo::EchoPeer;
use shellmux::mux::MuxConfig;
use shellmux::session::PeerEndpoint;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let peer = match PeerEndpoint::connect_from_env(MuxConfig::default()).await {
        Ok(peer) => peer,
        Err(err) => {
            eprintln!("shellmux-peer: {err}");
            std::process::exit(1);
        }
    };

    let env = std::env::vars().filter(|(key, _)| key != shellmux::session::spawn::CONNECT_ENV);
    if let Err(err) = EchoPeer::new(peer).with_env(env).run().await {
        eprintln!("shellmux-peer: {err}");
        std::process::exit(1);
    }
}
