use anyhow::Result;

fn main() -> Result<()> {
    hostpool::cli::run()
}
