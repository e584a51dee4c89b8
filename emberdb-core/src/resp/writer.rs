//! Request serializer
//!
//! Commands travel to the master as arrays of bulk strings. Drivers
//! compose commands as flat text lines (`REPLCONF ACK 2048`); the
//! serializer splits on spaces and frames each word.

/// Encode a command given as explicit arguments.
pub fn encode_command<A: AsRef<[u8]>>(args: &[A]) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + args.iter().map(|a| a.as_ref().len() + 16).sum::<usize>());
    out.extend_from_slice(format!("*{}\r\n", args.len()).as_bytes());
    for arg in args {
        let arg = arg.as_ref();
        out.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// Encode a command written as one space-separated line.
pub fn encode_command_line(line: &str) -> Vec<u8> {
    let words: Vec<&str> = line.split(' ').filter(|w| !w.is_empty()).collect();
    encode_command(&words)
}
