#![no_main]

use libfuzzer_sys::fuzz_target;
use tinyweb::buffer::Buffer;
use tinyweb::request::Request;

fuzz_target!(|data: &[u8]| {
    let mut buf = Buffer::new(data.len().max(1));
    buf.append(data);
    let mut request = Request::new();
    let _ = request.parse(&mut buf);
});
