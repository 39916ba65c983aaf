//! Connectivity probe: echo the payload back.

use super::{CommandStatus, EchoReply};

pub fn test_echo(value: String) -> EchoReply {
    EchoReply { status: CommandStatus::Success, data: value }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_echo_round_trip() {
        let reply = test_echo("ping".to_string());
        assert_eq!(reply.status, CommandStatus::Success);
        assert_eq!(reply.data, "ping");
    }
}
