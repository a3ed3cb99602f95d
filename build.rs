// Build script: link FFmpeg support libraries
fn main() {
    // Only the Windows MSVC toolchain needs the extra FFmpeg link inputs
    #[cfg(all(target_os = "windows", target_env = "msvc"))]
    {
        // Intel QSV (Quick Sync Video) hardware acceleration
        println!("cargo:rustc-link-lib=dylib=libmfx");

        // x264 encoder
        println!("cargo:rustc-link-lib=dylib=libx264");

        // OLE automation and VFW
        println!("cargo:rustc-link-lib=dylib=oleaut32");
        println!("cargo:rustc-link-lib=dylib=vfw32");

        // Secure Channel (TLS/SSL)
        println!("cargo:rustc-link-lib=dylib=secur32");
    }
}
