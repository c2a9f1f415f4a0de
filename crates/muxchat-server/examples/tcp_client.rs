use std::env;
use std::error::Error;
use std::io::{self, Write};
use std::sync::Arc;

use chrono::Utc;
use muxchat_protocol::{Command, CommandTable, Frame, JsonMarshaller, Marshaller, Reply, SendOne};
use muxchat_server::transport::{TcpTransport, Transport};
use tokio::net::TcpStream;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let addr = env::var("MUXCHAT_CLIENT_ADDR").unwrap_or_else(|_| "127.0.0.1:9000".to_string());
    let me = env::args().nth(1).unwrap_or_else(|| "alice".to_string());

    println!("Connecting to {} as {}...", addr, me);
    let stream = TcpStream::connect(&addr).await?;
    let conn = Arc::new(TcpTransport::new(stream, 1 << 20, None));
    conn.send(me.as_bytes()).await?;
    println!("Connected.");
    println!("Type messages like:");
    println!("  bob hello there");
    println!("Type 'quit' or 'exit' to leave.\n");

    let table = CommandTable::from_ids(Command::all_ids());

    // Print everything the server pushes at us.
    let reader = {
        let conn = conn.clone();
        let table = table.clone();
        tokio::spawn(async move {
            while let Ok(Some(raw)) = conn.receive().await {
                let Ok(frame) = Frame::parse(raw) else {
                    eprintln!("<< short frame");
                    continue;
                };
                let command = table.resolve(frame.header());
                match Command::from_id(command) {
                    Some(Command::SendOne) => match JsonMarshaller.unmarshal::<SendOne>(frame.payload()) {
                        Ok(msg) => println!("\n<< [{}] {}: {}", msg.send_at, msg.from, msg.message),
                        Err(_) => match JsonMarshaller.unmarshal::<Reply>(frame.payload()) {
                            Ok(reply) => println!("\n<< {:?}: {}{}", reply.reply_type, reply.tip, reply.debug),
                            Err(e) => eprintln!("\n<< undecodable payload: {}", e),
                        },
                    },
                    other => println!("\n<< {:?} ({} bytes)", other, frame.payload().len()),
                }
            }
            println!("\nServer closed the connection.");
        })
    };

    let stdin = io::stdin();
    loop {
        print!(">> ");
        io::stdout().flush()?;

        let mut line = String::new();
        if stdin.read_line(&mut line)? == 0 {
            println!("\nEOF on stdin, exiting client.");
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed.eq_ignore_ascii_case("quit") || trimmed.eq_ignore_ascii_case("exit") {
            println!("Exiting client.");
            break;
        }

        let Some((to, message)) = trimmed.split_once(' ') else {
            eprintln!("Expected: <recipient> <message>");
            continue;
        };
        let msg = SendOne {
            from: me.clone(),
            to: to.to_string(),
            send_at: Utc::now(),
            message: message.to_string(),
            extra: Vec::new(),
        };
        let Some(hash) = table.hash_of(Command::SendOne.id()) else {
            break;
        };
        let frame = Frame::encode(&hash, &JsonMarshaller.marshal(&msg)?);
        conn.send(frame.as_bytes()).await?;
    }

    conn.close().await;
    let _ = reader.await;
    Ok(())
}
