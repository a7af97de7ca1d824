// Replays realistic keystroke/output scripts through the parser and
// checks the committed command history and policy decisions.

use jumpgate_terminal::{CommandRule, RuleCategory, TermParser};

fn deny(id: i64, pattern: &str) -> CommandRule {
    CommandRule::deny(id, "rule", pattern)
}

#[test]
fn test_ssh_session_transcript() {
    let mut parser = TermParser::new("it", "ssh", vec![deny(1, r"^rm -rf /$")]);

    parser.add_output(b"Last login: Mon Jun  3 10:12:01\r\nuser@host:~$ ");

    let (cmd, forbidden) = parser.add_input(b"ls -la\r");
    assert_eq!(cmd.as_deref(), Some("ls -la"));
    assert!(!forbidden);
    parser.add_output(b"ls -la\r\ntotal 4\r\nuser@host:~$ ");

    // typo corrected with backspaces before commit
    let (cmd, forbidden) = parser.add_input(b"cat /etc/hostss\x7f\r");
    assert_eq!(cmd.as_deref(), Some("cat /etc/hosts"));
    assert!(!forbidden);
    parser.add_output(b"cat /etc/hosts\r\n127.0.0.1 localhost\r\nuser@host:~$ ");

    let (cmd, forbidden) = parser.add_input(b"rm -rf /\r");
    assert_eq!(cmd.as_deref(), Some("rm -rf /"));
    assert!(forbidden);

    // gateway cancels the line; session continues
    parser.add_input(b"\x15\r");
    let (cmd, forbidden) = parser.add_input(b"whoami\r");
    assert_eq!(cmd.as_deref(), Some("whoami"));
    assert!(!forbidden);

    assert_eq!(
        parser.commands(),
        &["ls -la", "cat /etc/hosts", "rm -rf /", "whoami"]
    );
}

#[test]
fn test_chunking_is_observationally_equal() {
    let script: &[u8] = b"echo one\rselect 1;\x7f\x7f\r\nuptime\r";

    let run = |chunks: Vec<&[u8]>| {
        let mut parser = TermParser::new("it", "ssh", vec![]);
        for chunk in chunks {
            parser.add_input(chunk);
        }
        parser.commands().to_vec()
    };

    let whole = run(vec![script]);
    let bytes = run(script.iter().map(std::slice::from_ref).collect());
    let halves = run(vec![&script[..7], &script[7..]]);

    assert_eq!(whole, bytes);
    assert_eq!(whole, halves);
}

#[test]
fn test_mysql_policy_on_terminated_statement() {
    let mut drop_rule = deny(5, r"(?i)^drop\s");
    drop_rule.category = RuleCategory::Database;
    let mut parser = TermParser::new("it", "mysql", vec![drop_rule]);

    let (cmd, forbidden) = parser.add_input(b"DROP\r");
    assert_eq!(cmd, None);
    assert!(!forbidden);

    let (cmd, forbidden) = parser.add_input(b"TABLE users;\r");
    assert_eq!(cmd.as_deref(), Some("DROP TABLE users;"));
    assert!(forbidden);
}

#[test]
fn test_redis_policy_normalizes_spacing() {
    let mut flush_rule = deny(6, r"(?i)^FLUSHALL$");
    flush_rule.category = RuleCategory::Database;
    let mut parser = TermParser::new("it", "redis", vec![flush_rule]);

    let (cmd, forbidden) = parser.add_input(b"   FLUSHALL   \r");
    assert_eq!(cmd.as_deref(), Some("FLUSHALL"));
    assert!(forbidden);
}

#[test]
fn test_close_flush_records_partial_input() {
    let mut parser = TermParser::new("it", "ssh", vec![]);
    parser.add_output(b"$ ");
    parser.add_input(b"tail -f /var/log/sys");
    let flushed = parser.close("$ ");
    assert_eq!(flushed.as_deref(), Some("tail -f /var/log/sys"));
}
