fn main() {
    std::process::exit(sph2d::platform::start());
}
