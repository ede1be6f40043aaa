fn main() -> anyhow::Result<()> {
    growflow::cli::run()
}
