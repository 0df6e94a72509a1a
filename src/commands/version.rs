pub fn run() -> anyhow::Result<()> {
    println!("sdn-zerotrust {}", env!("CARGO_PKG_VERSION"));
    Ok(())
}
