use {
    clap::Parser,
    log::{error, info, warn},
    p9srv::{HostFs, Server, SgReader, SgWriter, do_request, io_err, res},
    std::{
        io,
        path::{Path, PathBuf},
    },
    tokio::{
        fs,
        io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
        net::{TcpListener, UnixListener},
    },
};

mod utils;
use crate::utils::parse_proto;

/// Upper bound on one request frame; the reply buffer matches it, so
/// reads larger than this are capped by the server core.
const MAX_MSIZE: usize = 1 << 20;

/// Shortest possible message: size[4] type[1] tag[2].
const MIN_MSIZE: usize = 7;

#[derive(Debug, clap::Parser)]
struct Cli {
    /// proto!address!port
    /// where: proto = tcp | unix
    address: String,

    /// Directory to export
    exportdir: PathBuf,
}

/// One connection is one 9P session: it gets its own server state and a
/// frame loop feeding `do_request`.
async fn serve_stream<S>(stream: S, root: PathBuf) -> p9srv::Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let mut server = Server::new(HostFs::new(root));
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut respbuf = vec![0u8; MAX_MSIZE];

    loop {
        let mut sizebuf = [0u8; 4];
        match reader.read_exact(&mut sizebuf).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        let size = u32::from_le_bytes(sizebuf) as usize;
        if !(MIN_MSIZE..=MAX_MSIZE).contains(&size) {
            return res!(io_err!(InvalidData, "bad frame size"));
        }

        let mut frame = vec![0u8; size];
        frame[..4].copy_from_slice(&sizebuf);
        reader.read_exact(&mut frame[4..]).await?;

        let n = {
            let mut req = SgReader::new(vec![&frame[..]]);
            let mut resp = SgWriter::new(vec![&mut respbuf[..]]);
            do_request(&mut server, &mut req, &mut resp).await
        };
        writer.write_all(&respbuf[..n]).await?;
    }
}

async fn serve_tcp(root: PathBuf, addr: &str) -> p9srv::Result<()> {
    let listener = TcpListener::bind(addr).await?;

    loop {
        let (stream, peer) = listener.accept().await?;
        info!("accepted: {:?}", peer);

        let root = root.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_stream(stream, root).await {
                error!("session error: {}", e);
            }
        });
    }
}

struct DeleteOnDrop {
    path: PathBuf,
    listener: UnixListener,
}

impl DeleteOnDrop {
    fn bind(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_owned();
        UnixListener::bind(&path).map(|listener| DeleteOnDrop { path, listener })
    }
}

impl std::ops::Deref for DeleteOnDrop {
    type Target = UnixListener;

    fn deref(&self) -> &Self::Target {
        &self.listener
    }
}

impl Drop for DeleteOnDrop {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("failed to remove socket file {:?}: {}", self.path, e);
        }
    }
}

async fn serve_unix(root: PathBuf, path: &str) -> p9srv::Result<()> {
    let listener = DeleteOnDrop::bind(path)?;

    loop {
        let (stream, peer) = listener.accept().await?;
        info!("accepted: {:?}", peer);

        let root = root.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_stream(stream, root).await {
                error!("session error: {}", e);
            }
        });
    }
}

async fn expd_main(Cli { address, exportdir }: Cli) -> p9srv::Result<i32> {
    if !fs::try_exists(&exportdir).await? {
        fs::create_dir_all(&exportdir).await?;
    }
    if !fs::metadata(&exportdir).await?.is_dir() {
        return res!(io_err!(Other, "export path must be a directory"));
    }

    let (proto, addr) =
        parse_proto(&address).ok_or_else(|| io_err!(InvalidInput, "invalid protocol or address"))?;

    println!("[*] Ready to accept clients: {}", address);
    match proto {
        "tcp" => serve_tcp(exportdir, &addr).await,
        "unix" => serve_unix(exportdir, &addr).await,
        _ => res!(io_err!(InvalidInput, "protocol not supported")),
    }
    .and(Ok(0))
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let exit_code = expd_main(Cli::parse()).await.unwrap_or_else(|e| {
        eprintln!("Error: {:?}", e);
        -1
    });

    std::process::exit(exit_code);
}
