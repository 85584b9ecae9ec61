use tracing::{info_span, Level};

use dbbouncer::{init_runtime, init_settings, init_tracing, run_servers, Server};

fn main() {
    init_tracing(Level::INFO);

    let _span = info_span!("startup").entered();

    let settings = init_settings().expect("could not load config");
    let runtime = init_runtime(&settings).expect("could not create tokio runtime");
    let server = Server::build(settings).expect("could not build server");

    run_servers(server, &runtime);
}
