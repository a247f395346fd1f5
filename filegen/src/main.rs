use anyhow::{Context, Result};
use clap::Parser;
use rand::Rng;
use tokio::io::AsyncWriteExt;

#[derive(Parser, Debug)]
#[command(
    name = "filegen",
    version,
    about = "Generate a file of a given size filled with random bytes, for testing and benchmarking pfcp"
)]
struct Args {
    /// Path of the file to generate
    path: std::path::PathBuf,

    /// Size of the file. Accepts suffixes like "1KiB", "1MiB", "1GiB"
    filesize: bytesize::ByteSize,

    /// Size of the buffer used to write to the file
    #[arg(long, default_value = "1MiB", value_name = "SIZE")]
    bufsize: bytesize::ByteSize,
}

async fn write_file(path: &std::path::Path, mut filesize: usize, bufsize: usize) -> Result<()> {
    let mut bytes = vec![0u8; bufsize];
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .await
        .context(format!("Error opening {:?}", &path))?;
    while filesize > 0 {
        {
            // make sure rng falls out of scope before await
            let mut rng = rand::thread_rng();
            rng.fill(&mut bytes[..]);
        }
        let writesize = std::cmp::min(filesize, bufsize);
        file.write_all(&bytes[..writesize])
            .await
            .context(format!("Error writing to {:?}", &path))?;
        filesize -= writesize;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();
    let filesize = usize::try_from(args.filesize.0).context("file size too large")?;
    let bufsize = usize::try_from(args.bufsize.0)
        .ok()
        .filter(|bufsize| *bufsize > 0)
        .context("buffer size must be between 1 byte and the address space")?;
    write_file(&args.path, filesize, bufsize).await?;
    Ok(())
}
