//! Administrative client for the svchub control socket.
//!
//! Every subcommand is a thin encode/decode of one protocol command; the
//! only client-side logic is `restart`, which chains `stop` and `start`.

type Result<T> = color_eyre::eyre::Result<T>;

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use eyre::eyre;
use nix::errno::Errno;

use svchub::config::Config;
use svchub::protocol::{
    parse_list_reply, Attr, CommandCode, Message, NOTIFY_DIED,
};

#[derive(Parser)]
#[command(name = "svcctl")]
#[command(about = "Control the svchub service supervisor")]
#[command(version)]
struct Cli {
    /// Control socket path (default: the daemon's)
    #[arg(long)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// List all known services
    List,
    /// Show one service's state
    Status { name: String },
    /// Start a service
    Start { name: String },
    /// Run a service once; its slot is released after a clean exit
    Spawn { name: String },
    /// Start a service with pass-through stdio (no output capture)
    Stout { name: String },
    /// Stop a service and wait for it to die
    Stop { name: String },
    /// Stop a service, wait for the death, start it again
    Restart { name: String },
    /// Forget a stopped service
    Remove { name: String },
    /// Discard a service's captured output
    Flush { name: String },
    /// Send SIGHUP to a service
    Sighup { name: String },
    /// Print a service's captured output
    Output { name: String },
    /// Reboot the system
    Reboot,
    /// Shut the system down
    Shutdown,
    /// Power the system off
    Poweroff,
}

fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let socket = cli
        .socket
        .unwrap_or_else(Config::control_path_from_env);
    let mut client = Client::connect(&socket)?;

    match cli.command {
        Cmd::List => list(&mut client),
        Cmd::Status { name } => status(&mut client, &name),
        Cmd::Start { name } => simple(&mut client, CommandCode::Start, &name),
        Cmd::Spawn { name } => simple(&mut client, CommandCode::Spawn, &name),
        Cmd::Stout { name } => simple(&mut client, CommandCode::Stout, &name),
        Cmd::Stop { name } => stop(&mut client, &name),
        Cmd::Restart { name } => restart(&mut client, &name),
        Cmd::Remove { name } => simple(&mut client, CommandCode::Remove, &name),
        Cmd::Flush { name } => simple(&mut client, CommandCode::Flush, &name),
        Cmd::Sighup { name } => simple(&mut client, CommandCode::Sighup, &name),
        Cmd::Output { name } => output(&mut client, &name),
        Cmd::Reboot => bare(&mut client, CommandCode::Reboot),
        Cmd::Shutdown => bare(&mut client, CommandCode::Shutdown),
        Cmd::Poweroff => bare(&mut client, CommandCode::Poweroff),
    }
}

struct Client {
    stream: UnixStream,
}

impl Client {
    fn connect(path: &std::path::Path) -> Result<Self> {
        let stream = UnixStream::connect(path)
            .map_err(|err| eyre!("cannot reach svchub at {}: {err}", path.display()))?;
        Ok(Client { stream })
    }

    fn send(&mut self, msg: &Message) -> Result<()> {
        let payload = msg.encode();
        self.stream
            .write_all(&(payload.len() as u32).to_be_bytes())?;
        self.stream.write_all(&payload)?;
        Ok(())
    }

    fn recv(&mut self) -> Result<Message> {
        let mut prefix = [0u8; 4];
        self.stream.read_exact(&mut prefix)?;
        let len = u32::from_be_bytes(prefix) as usize;
        let mut payload = vec![0u8; len];
        self.stream.read_exact(&mut payload)?;
        Ok(Message::decode(&payload)?)
    }

    fn roundtrip(&mut self, msg: &Message) -> Result<Message> {
        self.send(msg)?;
        self.recv()
    }
}

/// Turn a negative reply status into a readable error.
fn check(reply: &Message) -> Result<()> {
    if reply.code < 0 {
        let errno = Errno::from_raw(-reply.code);
        return Err(eyre!("{}", errno.desc()));
    }
    Ok(())
}

fn named_request(cmd: CommandCode, name: &str) -> Message {
    Message::request(cmd).with(Attr::Name(name.to_string()))
}

fn simple(client: &mut Client, cmd: CommandCode, name: &str) -> Result<()> {
    let reply = client.roundtrip(&named_request(cmd, name))?;
    check(&reply)
}

fn bare(client: &mut Client, cmd: CommandCode) -> Result<()> {
    let reply = client.roundtrip(&Message::request(cmd))?;
    check(&reply)
}

/// The reply to `stop` is deferred until the service actually died.
fn stop(client: &mut Client, name: &str) -> Result<()> {
    let reply = client.roundtrip(&named_request(CommandCode::Stop, name))?;
    check(&reply)?;
    if reply.code == NOTIFY_DIED {
        println!("{name} stopped");
    }
    Ok(())
}

fn restart(client: &mut Client, name: &str) -> Result<()> {
    let reply = client.roundtrip(&named_request(CommandCode::Stop, name))?;
    // Already-stopped is fine for a restart.
    if reply.code < 0 && reply.code != -(Errno::EAGAIN as i32) {
        check(&reply)?;
    }
    simple(client, CommandCode::Start, name)
}

fn list(client: &mut Client) -> Result<()> {
    let mut cursor: Option<u32> = None;
    loop {
        let mut request = Message::request(CommandCode::List);
        if let Some(cursor) = cursor {
            request = request.with(Attr::Cursor(cursor));
        }
        let reply = client.roundtrip(&request)?;
        check(&reply)?;
        let (records, next) = parse_list_reply(&reply);
        for record in records {
            let state = match (record.pid, record.exit_code) {
                (Some(pid), _) => format!("pid {pid}"),
                (None, Some(code)) => format!("exited {code}"),
                (None, None) => "stopped".to_string(),
            };
            let log = if record.has_output { " [output]" } else { "" };
            println!("{:<24} {state}{log}", record.name);
        }
        match next {
            Some(next) => cursor = Some(next),
            None => return Ok(()),
        }
    }
}

fn status(client: &mut Client, name: &str) -> Result<()> {
    let reply = client.roundtrip(&named_request(CommandCode::Status, name))?;
    check(&reply)?;
    let mut pid = None;
    let mut exit_code = None;
    let mut uptime = None;
    let mut has_output = false;
    for attr in &reply.attrs {
        match attr {
            Attr::Pid(p) => pid = Some(*p),
            Attr::ExitCode(c) => exit_code = Some(*c),
            Attr::Uptime(u) => uptime = Some(*u),
            Attr::HasOutput => has_output = true,
            _ => {}
        }
    }
    match (pid, exit_code) {
        (Some(pid), _) => {
            println!("{name}: running, pid {pid}, up {}", format_uptime(uptime.unwrap_or(0)));
        }
        (None, Some(code)) => println!("{name}: exited with {code}"),
        (None, None) => println!("{name}: never started"),
    }
    if has_output {
        println!("{name}: has captured output");
    }
    Ok(())
}

fn output(client: &mut Client, name: &str) -> Result<()> {
    let reply = client.roundtrip(&named_request(CommandCode::GetBuf, name))?;
    check(&reply)?;
    if let Some(buffer) = reply.buffer() {
        std::io::stdout().write_all(buffer)?;
    }
    Ok(())
}

fn format_uptime(secs: u64) -> String {
    if secs >= 3600 {
        format!("{}h{}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m{}s", secs / 60, secs % 60)
    } else {
        format!("{secs}s")
    }
}
