use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use sluice_proxy::{ProxyConfig, ProxyServer};
use sluice_settings::{ConfigLoader, SluiceConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::error::CliError;

const SELF_TEST_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn check(cwd: PathBuf) -> Result<(), CliError> {
    let mut all_ok = true;

    println!("Platform: {}", std::env::consts::OS);
    println!("Architecture: {}", std::env::consts::ARCH);

    match tokio::time::timeout(SELF_TEST_TIMEOUT, self_test()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            println!("Proxy: FAIL — {e}");
            all_ok = false;
        }
        Err(_) => {
            println!("Proxy: FAIL — self-test timed out after {SELF_TEST_TIMEOUT:?}");
            all_ok = false;
        }
    }

    println!("\nConfig files:");
    for path in [
        ConfigLoader::global_config_path(),
        ConfigLoader::project_config_path(&cwd),
    ] {
        if !report_config_file(&path) {
            all_ok = false;
        }
    }

    if !all_ok {
        return Err(CliError::Other("One or more checks failed".to_string()));
    }

    Ok(())
}

/// Start a loopback proxy and push one tunnel and one plain request through it.
async fn self_test() -> Result<(), CliError> {
    let target = TcpListener::bind("127.0.0.1:0").await?;
    let target_addr = target.local_addr()?;
    let echo = tokio::spawn(echo_server(target));

    let config = ProxyConfig {
        bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        connect_timeout: Duration::from_secs(2),
        ..Default::default()
    };
    let handle = ProxyServer::new(config)?.start().await?;
    let proxy_addr = handle.local_addr();
    println!("Proxy: listening on {proxy_addr}");

    let tunnel = check_tunnel(proxy_addr, target_addr).await;
    print_check("Proxy (CONNECT tunnel)", &tunnel);
    let plain = check_plain_http(proxy_addr, target_addr).await;
    print_check("Proxy (plain HTTP)", &plain);

    handle.shutdown().await?;
    echo.abort();
    tunnel.and(plain)
}

fn print_check(name: &str, result: &Result<(), CliError>) {
    match result {
        Ok(()) => println!("{name}: OK"),
        Err(e) => println!("{name}: FAIL — {e}"),
    }
}

async fn echo_server(listener: TcpListener) {
    while let Ok((mut stream, _)) = listener.accept().await {
        tokio::spawn(async move {
            let (mut reader, mut writer) = stream.split();
            let _ = tokio::io::copy(&mut reader, &mut writer).await;
        });
    }
}

async fn check_tunnel(proxy: SocketAddr, target: SocketAddr) -> Result<(), CliError> {
    let mut client = TcpStream::connect(proxy).await?;
    client
        .write_all(format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n").as_bytes())
        .await?;

    let mut ack = [0u8; 19];
    client.read_exact(&mut ack).await?;
    if &ack != b"HTTP/1.1 200 OK\r\n\r\n" {
        return Err(CliError::Other(format!(
            "unexpected CONNECT response {:?}",
            String::from_utf8_lossy(&ack)
        )));
    }

    client.write_all(b"ping").await?;
    let mut echoed = [0u8; 4];
    client.read_exact(&mut echoed).await?;
    if &echoed != b"ping" {
        return Err(CliError::Other("tunnel altered relayed bytes".to_string()));
    }
    Ok(())
}

async fn check_plain_http(proxy: SocketAddr, target: SocketAddr) -> Result<(), CliError> {
    let request = format!("GET /sluice-check HTTP/1.1\r\nHost: {target}\r\n\r\n");
    let mut client = TcpStream::connect(proxy).await?;
    client.write_all(request.as_bytes()).await?;

    // The echo target returns exactly what the proxy forwarded.
    let mut echoed = vec![0u8; request.len()];
    client.read_exact(&mut echoed).await?;
    if echoed != request.as_bytes() {
        return Err(CliError::Other(
            "request was not forwarded verbatim".to_string(),
        ));
    }
    Ok(())
}

/// Print one config file's status. Returns `false` if it exists but does not parse.
fn report_config_file(path: &Path) -> bool {
    if !path.exists() {
        println!("  {} (not found)", path.display());
        return true;
    }
    match SluiceConfig::load(path) {
        Ok(_) => {
            println!("  {} (found)", path.display());
            true
        }
        Err(e) => {
            println!("  {} (invalid: {e})", path.display());
            false
        }
    }
}
