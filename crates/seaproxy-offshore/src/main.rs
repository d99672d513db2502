fn main() -> anyhow::Result<()> {
    smol::block_on(seaproxy_offshore::run())
}
