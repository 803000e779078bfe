fn main() {
    ternd_cmd::run();
}
