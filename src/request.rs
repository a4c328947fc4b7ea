use bytes::{BufMut, Bytes, BytesMut};

/// Encode one outbound command as a RESP multi-bulk array: `*N\r\n`
/// followed by one `$len\r\n<bytes>\r\n` bulk item for the command name
/// and each argument. Arguments are binary safe.
pub fn write_command(dst: &mut BytesMut, command: &[u8], args: &[Bytes]) {
    dst.reserve(encoded_len(command, args));

    dst.put_u8(b'*');
    dst.put_slice((1 + args.len()).to_string().as_bytes());
    dst.put_slice(b"\r\n");

    write_bulk(dst, command);
    for arg in args {
        write_bulk(dst, arg);
    }
}

fn write_bulk(dst: &mut BytesMut, data: &[u8]) {
    dst.put_u8(b'$');
    dst.put_slice(data.len().to_string().as_bytes());
    dst.put_slice(b"\r\n");
    dst.put_slice(data);
    dst.put_slice(b"\r\n");
}

fn encoded_len(command: &[u8], args: &[Bytes]) -> usize {
    let header = 1 + decimal_width(1 + args.len()) + 2;
    let bulk = |len: usize| 1 + decimal_width(len) + 2 + len + 2;
    header + bulk(command.len()) + args.iter().map(|a| bulk(a.len())).sum::<usize>()
}

fn decimal_width(mut value: usize) -> usize {
    let mut width = 1;
    while value >= 10 {
        value /= 10;
        width += 1;
    }
    width
}
