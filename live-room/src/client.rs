use anyhow::{Context, Result};
use futures_util::{
    Sink, SinkExt, Stream, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::{
    io::{self, AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    net::TcpStream,
    select,
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream,
    tungstenite::{self, Message},
};
use tracing::{info, warn};

use crate::{
    cli::ClientArgs,
    message::{ChatMessage, encode},
};

type RoomStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type RoomWriter = SplitSink<RoomStream, Message>;
type RoomReader = SplitStream<RoomStream>;

pub async fn run(args: ClientArgs) -> Result<()> {
    let (mut reader, mut writer) = establish_connection(&args).await?;

    // `next_line` is cancel safe, so a half-typed line survives a server
    // frame winning the select below.
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    run_client_loop(&mut reader, &mut writer, &mut stdin, &args.name).await?;
    shutdown_connection(&mut writer).await;

    Ok(())
}

async fn establish_connection(args: &ClientArgs) -> Result<(RoomReader, RoomWriter)> {
    let (stream, _) = tokio_tungstenite::connect_async(args.server.as_str())
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;

    info!("connected to {}", args.server);

    let (writer, reader) = stream.split();
    Ok((reader, writer))
}

async fn run_client_loop<R, W, I>(
    reader: &mut R,
    writer: &mut W,
    stdin: &mut Lines<I>,
    name: &str,
) -> Result<()>
where
    R: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    W: Sink<Message, Error = tungstenite::Error> + Unpin,
    I: AsyncBufRead + Unpin,
{
    loop {
        select! {
            frame = reader.next() => {
                if !handle_server_frame(frame).await? {
                    break;
                }
            }
            line = stdin.next_line() => {
                if !handle_stdin_line(line, writer, name).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }
    Ok(())
}

async fn handle_server_frame(
    frame: Option<Result<Message, tungstenite::Error>>,
) -> Result<bool> {
    match frame {
        Some(Ok(Message::Text(text))) => {
            write_stdout(&render_frame(&text)).await?;
            Ok(true)
        }
        Some(Ok(Message::Binary(bytes))) => {
            write_stdout(&render_frame(&String::from_utf8_lossy(&bytes))).await?;
            Ok(true)
        }
        Some(Ok(Message::Close(_))) | None => {
            write_stdout("*** server closed the connection").await?;
            Ok(false)
        }
        Some(Ok(_)) => Ok(true),
        Some(Err(err)) => Err(err).context("failed to read from live room"),
    }
}

async fn handle_stdin_line<W>(
    line: io::Result<Option<String>>,
    writer: &mut W,
    name: &str,
) -> Result<bool>
where
    W: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let Some(line) = line? else {
        return Ok(false);
    };

    let text = line.trim_end();
    if text.is_empty() {
        return Ok(true);
    }

    if text.eq_ignore_ascii_case("/quit") {
        write_stdout("*** leaving live room").await?;
        return Ok(false);
    }

    let frame = encode(&ChatMessage::new(name, text))?;
    writer.send(Message::Text(frame)).await?;
    Ok(true)
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn shutdown_connection(writer: &mut RoomWriter) {
    if let Err(error) = writer.close().await {
        warn!(?error, "failed to close live room connection cleanly");
    }
}

/// Chat-shaped frames render as `<name> text`; anything else is shown raw.
fn render_frame(text: &str) -> String {
    match serde_json::from_str::<ChatMessage>(text) {
        Ok(ChatMessage { name, text }) => format!("<{name}> {text}"),
        Err(_) => text.to_string(),
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

#[cfg(test)]
mod tests {
    use std::{
        pin::pin,
        sync::{Arc, Mutex},
        time::Duration,
    };

    use futures_util::{sink, stream};
    use tokio::{sync::mpsc, time::sleep};

    use super::*;

    #[tokio::test]
    async fn partial_stdin_line_survives_incoming_frames() {
        let (mut typing, typed) = tokio::io::duplex(64);
        let mut stdin = BufReader::new(typed).lines();

        let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<Message>();
        let mut reader = stream::poll_fn(move |cx| frames_rx.poll_recv(cx).map(|m| m.map(Ok::<_, tungstenite::Error>)));

        let sent = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&sent);
        let mut writer = pin!(sink::unfold((), move |(), message: Message| {
            let captured = Arc::clone(&captured);
            async move {
                captured.lock().unwrap().push(message);
                Ok::<_, tungstenite::Error>(())
            }
        }));

        let typist = async move {
            typing.write_all(b"hel").await.expect("type");
            sleep(Duration::from_millis(50)).await;
            frames_tx
                .send(Message::Text(r#"{"name":"B","text":"hi"}"#.into()))
                .expect("deliver frame");
            sleep(Duration::from_millis(50)).await;
            typing.write_all(b"lo\n").await.expect("type");
            sleep(Duration::from_millis(50)).await;
            // Dropping `typing` ends stdin and the loop with it.
        };

        let (result, ()) = tokio::join!(
            run_client_loop(&mut reader, &mut writer, &mut stdin, "sam"),
            typist
        );
        result.expect("client loop");

        let sent = sent.lock().unwrap().clone();
        assert_eq!(
            sent,
            vec![Message::Text(r#"{"name":"sam","text":"hello"}"#.into())]
        );
    }

    #[test]
    fn renders_chat_and_raw_frames() {
        assert_eq!(
            render_frame(r#"{"name":"System","text":"hi all"}"#),
            "<System> hi all"
        );
        assert_eq!(
            render_frame(r#"{"name":"A","text":"hey","mood":"calm"}"#),
            "<A> hey"
        );
        assert_eq!(render_frame(r#"{"score":9}"#), r#"{"score":9}"#);
    }
}
