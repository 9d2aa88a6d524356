use std::str;

use vrpc::{Client, Server};

const ECHO: (u32, u32) = (1, 1);
const ADD: (u32, u32) = (1, 2);

fn main() {
    env_logger::init();
    may::config().set_workers(2);

    let server = Server::new();
    server.register(ECHO.0, ECHO.1, |req| req.to_vec());
    server.register_typed(ADD.0, ADD.1, |(x, y): (u32, u32)| x + y);

    let addr = ("127.0.0.1", 4000);
    let _instance = server.start(addr).unwrap();
    let client = Client::connect(addr).unwrap();

    for i in 0..10 {
        let req = format!("Hello World! id={i}");
        let rsp = client.request(ECHO.0, ECHO.1, req.as_bytes()).unwrap();
        println!("recv = {:?}", str::from_utf8(&rsp).unwrap());
    }

    for i in 0..10u32 {
        let sum: u32 = client.call(ADD.0, ADD.1, &(i, i)).unwrap();
        println!("recv = {sum}");
    }

    client.close();
    server.shutdown();
}
