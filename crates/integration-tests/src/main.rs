#[cfg(test)]
mod proxy;
#[cfg(test)]
mod sink;
#[cfg(test)]
mod test;

fn main() {
    println!("Run me via `cargo nextest run` or `cargo test`");
}
