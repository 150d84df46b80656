fn main() -> anyhow::Result<()> {
    infra_harness::cli::run()
}
