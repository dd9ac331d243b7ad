use anyhow::Result;

fn main() -> Result<()> {
    runbox::cli::run()
}
