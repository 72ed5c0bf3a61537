use mill_conn::prelude::*;
use tracing_subscriber::EnvFilter;

struct HttpResponse {
    status: u16,
    body: String,
}

impl HttpResponse {
    fn ok(body: &str) -> Self {
        Self {
            status: 200,
            body: body.to_string(),
        }
    }

    fn not_found() -> Self {
        Self {
            status: 404,
            body: "<h1>404 Not Found</h1>".to_string(),
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        let reason = match self.status {
            200 => "OK",
            404 => "Not Found",
            _ => "Unknown",
        };
        format!(
            "HTTP/1.1 {} {}\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            self.status,
            reason,
            self.body.len(),
            self.body
        )
        .into_bytes()
    }
}

struct Hello;

impl HttpApp for Hello {
    fn process(&self, conn: &mut HttpConnection) -> anyhow::Result<()> {
        let request = &conn.state().request;
        let response = match (request.method.as_str(), request.url.as_str()) {
            ("GET", "/") => HttpResponse::ok("<h1>Hello from mill-conn</h1>"),
            ("GET", "/health") => HttpResponse::ok("<p>ok</p>"),
            ("POST", "/echo") => HttpResponse::ok(&String::from_utf8_lossy(&request.body)),
            _ => HttpResponse::not_found(),
        };
        tracing::info!(conn = %conn.id(), method = %request.method, url = %request.url, status = response.status);
        conn.send(&response.to_bytes())?;
        Ok(())
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = EngineConfig::builder()
        .address("127.0.0.1:8080".parse()?)
        .workers(4)
        .build()?;
    let mut server = Server::bind(config, HttpProtocol::new(Hello))?;

    let addr = format!("http://{}", server.local_addr()?);
    println!("HTTP server listening on {}", addr);
    println!("  GET  {}/", addr);
    println!("  GET  {}/health", addr);
    println!("  POST {}/echo", addr);

    server.run()?;
    Ok(())
}
