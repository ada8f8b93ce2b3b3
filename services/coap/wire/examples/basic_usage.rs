//! Basic usage example for the CoAP wire protocol.

use bytes::Bytes;
use coap_wire::{
    media_type, option_number, Code, Message, MessageBuilder, MessageType,
    DEFAULT_MAX_MESSAGE_SIZE,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== CoAP Wire Protocol Example ===\n");

    // 1. Create a confirmable GET request
    println!("1. Creating a CON GET request...");
    let request = MessageBuilder::get("/oic/res")
        .message_id(0x1234)
        .token(Bytes::from_static(&[0xCA, 0xFE]))
        .query("rt=oic.wk.d")
        .build();

    let datagram = request.encode(DEFAULT_MAX_MESSAGE_SIZE)?;
    println!("   Encoded request size: {} bytes", datagram.len());

    // 2. Decode it again
    println!("\n2. Decoding the request...");
    let decoded = Message::decode(datagram)?;
    println!("   Type: {}", decoded.typ);
    println!("   Code: {}", decoded.code);
    println!("   Message ID: 0x{:04X}", decoded.message_id);
    println!("   Path: {}", decoded.path());
    if let Some(query) = decoded.option(option_number::URI_QUERY) {
        println!("   Query: {}", String::from_utf8_lossy(query));
    }

    // 3. Piggybacked response
    println!("\n3. Building a piggybacked response...");
    let response = MessageBuilder::new(MessageType::Acknowledgement, Code::CONTENT)
        .message_id(decoded.message_id)
        .token(decoded.token.clone())
        .content_format(media_type::APP_JSON)
        .payload(Bytes::from_static(b"{\"n\":\"device\"}"))
        .build();
    let datagram = response.encode(DEFAULT_MAX_MESSAGE_SIZE)?;
    println!("   Encoded response size: {} bytes", datagram.len());

    // 4. Ping (empty CON)
    println!("\n4. Encoding a ping...");
    let ping = Message::empty(MessageType::Confirmable, 0x0001);
    println!("   Ping bytes: {:02x?}", &ping.encode(DEFAULT_MAX_MESSAGE_SIZE)?[..]);

    println!("\n=== Example completed successfully! ===");
    Ok(())
}
