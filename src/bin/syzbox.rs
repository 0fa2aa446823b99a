use anyhow::Result;

fn main() -> Result<()> {
    syzbox::cli::run()
}
