fn main() -> anyhow::Result<()> {
    env_logger::init();
    let matches = hbus::cli::parse_args();

    if matches.get_flag("list-ports") {
        return hbus::cli::actions::list_ports();
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(hbus::cli::actions::run(&matches))
}
