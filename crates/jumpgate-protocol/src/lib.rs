// jumpgate-protocol: Guacamole wire protocol codec
//
// Instructions have the form `opcode(,<len>.<arg>)*;` where every argument
// is prefixed by its UTF-8 byte length. Arguments may be empty (`0.`).
// Base64 payloads inside `error` instructions are carried opaquely.

mod parser;
mod stream;

pub use parser::{scan, Frame, FrameError, Instruction, ScanOutcome, MAX_INSTRUCTION_SIZE};
pub use stream::InstructionStream;

// Guacamole status codes (subset the gateway emits or interprets)
pub const STATUS_SERVER_ERROR: u32 = 512;
pub const STATUS_SERVER_BUSY: u32 = 513;
pub const STATUS_UPSTREAM_TIMEOUT: u32 = 514;
pub const STATUS_UPSTREAM_ERROR: u32 = 515;
pub const STATUS_RESOURCE_NOT_FOUND: u32 = 516;
pub const STATUS_RESOURCE_CONFLICT: u32 = 517;
pub const STATUS_RESOURCE_CLOSED: u32 = 518;
pub const STATUS_UPSTREAM_NOT_FOUND: u32 = 519;
pub const STATUS_UPSTREAM_UNAVAILABLE: u32 = 520;
pub const STATUS_CLIENT_BAD_REQUEST: u32 = 768;
pub const STATUS_CLIENT_UNAUTHORIZED: u32 = 769;
pub const STATUS_CLIENT_FORBIDDEN: u32 = 771;
pub const STATUS_CLIENT_TIMEOUT: u32 = 776;

/// Format a protocol instruction with length-prefixed arguments.
///
/// Lengths are UTF-8 byte lengths, matching what the decoder expects.
///
/// # Example
///
/// ```
/// use jumpgate_protocol::encode_instruction;
///
/// let instr = encode_instruction("size", &["1024", "768", "96"]);
/// assert_eq!(instr, "size,4.1024,3.768,2.96;");
/// ```
pub fn encode_instruction(opcode: &str, args: &[&str]) -> String {
    let mut result = String::with_capacity(opcode.len() + args.iter().map(|a| a.len() + 8).sum::<usize>() + 1);
    result.push_str(opcode);
    for arg in args {
        result.push(',');
        result.push_str(&arg.len().to_string());
        result.push('.');
        result.push_str(arg);
    }
    result.push(';');
    result
}
