use anyhow::Result;

fn main() -> Result<()> {
    synthmon_server::cli::execute()
}
